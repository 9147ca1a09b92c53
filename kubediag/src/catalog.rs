//! Runbook catalog index
//!
//! Summaries come from `catalog.json` files and are held in memory; document
//! bodies are only read when a link is fetched. An index is immutable once
//! built, and reloads build a new one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CatalogConfig;
use crate::error::ToolError;

pub const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Document path relative to the directory holding the catalog
    pub link: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Default)]
pub struct CatalogIndex {
    entries: Vec<CatalogEntry>,
    documents: HashMap<String, PathBuf>,
}

impl CatalogIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the index from the primary directory and any additional ones.
    ///
    /// Entries whose document is missing are skipped. When two directories
    /// list the same link, the first one wins.
    pub fn load(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let mut index = Self::empty();
        let dirs = std::iter::once(&config.dir).chain(config.additional_dirs.iter());
        for dir in dirs {
            index.merge_dir(dir)?;
        }
        info!(entries = index.len(), "Runbook catalog loaded");
        Ok(index)
    }

    fn merge_dir(&mut self, dir: &Path) -> Result<(), CatalogError> {
        let catalog_path = dir.join(CATALOG_FILE);
        if !catalog_path.exists() {
            warn!(dir = %dir.display(), "No {} found, skipping directory", CATALOG_FILE);
            return Ok(());
        }
        let raw = std::fs::read_to_string(&catalog_path).map_err(|e| CatalogError::Io {
            path: catalog_path.clone(),
            source: e,
        })?;
        let file: CatalogFile = serde_json::from_str(&raw).map_err(|e| CatalogError::Parse {
            path: catalog_path.clone(),
            source: e,
        })?;

        for entry in file.catalog {
            if !is_relative_link(&entry.link) {
                warn!(link = %entry.link, "Runbook link escapes its directory, skipping");
                continue;
            }
            if self.documents.contains_key(&entry.link) {
                debug!(link = %entry.link, "Runbook already indexed from an earlier directory");
                continue;
            }
            let path = dir.join(&entry.link);
            if !path.is_file() {
                warn!(link = %entry.link, dir = %dir.display(), "Runbook file not found, skipping");
                continue;
            }
            debug!(title = %entry.title, "Indexed runbook");
            self.documents.insert(entry.link.clone(), path);
            self.entries.push(entry);
        }
        Ok(())
    }

    /// Summaries in catalog order. No I/O.
    pub fn list_summaries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read the full document behind `link`.
    pub async fn fetch(&self, link: &str) -> Result<String, ToolError> {
        let path = self
            .documents
            .get(link)
            .ok_or_else(|| ToolError::DocumentNotFound(link.to_string()))?;
        match tokio::fs::read_to_string(path).await {
            Ok(body) => Ok(body),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(link, "Indexed runbook vanished from disk");
                Err(ToolError::DocumentNotFound(link.to_string()))
            }
            Err(e) => Err(ToolError::ExecutionFailed(format!(
                "failed to read runbook '{}': {}",
                link, e
            ))),
        }
    }
}

fn is_relative_link(link: &str) -> bool {
    let path = Path::new(link);
    !link.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
