//! Atomically swapped, immutable engine state.
//!
//! Runs take an `Arc` of the current snapshot when they start and keep it
//! for their whole lifetime. Reloads publish a new snapshot; nothing is
//! ever patched in place.

use std::sync::{Arc, RwLock};

use crate::catalog::CatalogIndex;
use crate::config::EngineConfig;
use crate::tools::ToolRegistry;

/// Tools, runbooks and run settings as seen by one run.
#[derive(Debug)]
pub struct EngineSnapshot {
    pub registry: ToolRegistry,
    pub catalog: Arc<CatalogIndex>,
    pub settings: EngineConfig,
    /// Monotonic generation, bumped on every reload
    pub generation: u64,
}

impl EngineSnapshot {
    pub fn new(registry: ToolRegistry, catalog: Arc<CatalogIndex>, settings: EngineConfig) -> Self {
        Self {
            registry,
            catalog,
            settings,
            generation: 0,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotCell<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn load(&self) -> Arc<T> {
        let guard = self.current.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    /// Publish `next`, returning the snapshot it replaced.
    pub fn store(&self, next: T) -> Arc<T> {
        let next = Arc::new(next);
        let mut guard = self.current.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *guard, next)
    }
}
