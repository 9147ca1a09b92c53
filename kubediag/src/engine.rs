//! Engine facade
//!
//! Owns the published [`EngineSnapshot`], the reasoning collaborator and the
//! pool of bridge clients. Every question becomes an independent task with
//! its own event channel and cancellation token.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{connector_for, BridgeClient, Liveness, RemoteToolInfo};
use crate::catalog::{CatalogEntry, CatalogError, CatalogIndex};
use crate::config::{load_config, AppConfig, ConfigError, TransportConfig};
use crate::error::CollaboratorError;
use crate::llm::OpenAiCollaborator;
use crate::orchestrator::{drive, Collaborator, OrchestrationRun, RunContext};
use crate::snapshot::{EngineSnapshot, SnapshotCell};
use crate::streaming::{EventSink, RunReport, StreamEvent};
use crate::tools::builtin::{kubernetes_tools, prometheus_tools, runbook_tool};
use crate::tools::{ToolDescriptor, ToolProvider, ToolRegistry, ToolSpec};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Run task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Overrides the configured step budget (still clamped to the ceiling)
    pub max_steps: Option<u32>,
    /// Externally owned cancellation signal for this run
    pub cancel: Option<CancellationToken>,
}

/// A run that reached a terminal state.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub run: OrchestrationRun,
    pub report: RunReport,
}

/// Handle to a spawned run.
pub struct RunHandle {
    pub run_id: String,
    /// First subscriber, created before the run started so it sees every event
    pub events: broadcast::Receiver<StreamEvent>,
    cancel: CancellationToken,
    sink: EventSink,
    join: JoinHandle<FinishedRun>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Late subscribers only see events published after subscribing.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<StreamEvent>> {
        self.sink.subscribe()
    }

    /// Split into the event receiver and a future resolving to the finished run.
    pub fn into_parts(self) -> (broadcast::Receiver<StreamEvent>, RunCompletion) {
        (self.events, RunCompletion { join: self.join })
    }

    pub async fn wait(self) -> Result<FinishedRun, EngineError> {
        RunCompletion { join: self.join }.wait().await
    }
}

pub struct RunCompletion {
    join: JoinHandle<FinishedRun>,
}

impl RunCompletion {
    pub async fn wait(self) -> Result<FinishedRun, EngineError> {
        self.join.await.map_err(|e| EngineError::Join(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub name: String,
    pub endpoint: String,
    pub liveness: Liveness,
    pub connect_attempts: u64,
    pub in_flight: usize,
}

pub struct Engine {
    snapshot: SnapshotCell<EngineSnapshot>,
    collaborator: Arc<dyn Collaborator>,
    bridges: Mutex<HashMap<TransportConfig, Arc<BridgeClient>>>,
    generation: AtomicU64,
    /// Serializes reloads so generations are published in order
    reload_lock: tokio::sync::Mutex<()>,
    config_path: Option<PathBuf>,
}

impl Engine {
    /// Build an engine whose collaborator is the configured LLM.
    pub async fn from_config(
        config: AppConfig,
        config_path: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        let collaborator = Arc::new(OpenAiCollaborator::new(config.llm.clone())?);
        let mut engine = Self::new(config, collaborator).await?;
        engine.config_path = config_path;
        Ok(engine)
    }

    pub async fn new(
        config: AppConfig,
        collaborator: Arc<dyn Collaborator>,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            snapshot: SnapshotCell::new(EngineSnapshot::new(
                ToolRegistry::new(),
                Arc::new(CatalogIndex::empty()),
                config.engine.clone(),
            )),
            collaborator,
            bridges: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
            config_path: None,
        };
        engine.reload(config).await?;
        Ok(engine)
    }

    /// Build from tools assembled by the caller instead of configuration.
    pub fn with_snapshot(snapshot: EngineSnapshot, collaborator: Arc<dyn Collaborator>) -> Self {
        Self {
            snapshot: SnapshotCell::new(snapshot),
            collaborator,
            bridges: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
            config_path: None,
        }
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshot.load()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot.load().generation
    }

    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.snapshot.load().registry.specs()
    }

    pub fn runbooks(&self) -> Vec<CatalogEntry> {
        self.snapshot.load().catalog.list_summaries().to_vec()
    }

    pub fn bridge_status(&self) -> Vec<BridgeStatus> {
        let pool = self.bridges.lock().unwrap_or_else(|p| p.into_inner());
        let mut status: Vec<BridgeStatus> = pool
            .values()
            .map(|client| BridgeStatus {
                name: client.name().to_string(),
                endpoint: client.endpoint(),
                liveness: client.liveness(),
                connect_attempts: client.connect_attempts(),
                in_flight: client.in_flight(),
            })
            .collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Reload configuration from the file the engine was started with.
    pub async fn reload_from_disk(&self) -> Result<u64, EngineError> {
        let (config, _) = load_config(self.config_path.as_deref())?;
        self.reload(config).await
    }

    /// Build a new snapshot and publish it. Runs already started keep theirs.
    pub async fn reload(&self, config: AppConfig) -> Result<u64, EngineError> {
        let _reloading = self.reload_lock.lock().await;
        let catalog_config = config.catalog.clone();
        let catalog = tokio::task::spawn_blocking(move || CatalogIndex::load(&catalog_config))
            .await
            .map_err(|e| EngineError::Join(e.to_string()))??;
        let catalog = Arc::new(catalog);
        let mut registry = ToolRegistry::new();
        let mut candidates: Vec<ToolDescriptor> = Vec::new();

        let toolsets = &config.toolsets;
        if toolsets.kubernetes.enabled {
            candidates.extend(kubernetes_tools(&toolsets.kubernetes));
        }
        if toolsets.prometheus.enabled {
            match prometheus_tools(&toolsets.prometheus) {
                Ok(tools) => candidates.extend(tools),
                Err(e) => warn!("Prometheus toolset disabled: {}", e),
            }
        }
        candidates.push(runbook_tool(Arc::clone(&catalog)));
        candidates.extend(self.bridged_tools(&config).await);

        for descriptor in candidates {
            let source = descriptor.source();
            if let Err(e) = registry.register(descriptor) {
                warn!(source = %source, "Skipping tool: {}", e);
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            generation,
            tools = registry.len(),
            runbooks = catalog.len(),
            "Publishing engine snapshot"
        );
        let mut snapshot = EngineSnapshot::new(registry, catalog, config.engine.clone());
        snapshot.generation = generation;
        self.snapshot.store(snapshot);
        Ok(generation)
    }

    async fn bridged_tools(&self, config: &AppConfig) -> Vec<ToolDescriptor> {
        let default_timeout = Duration::from_secs(config.engine.tool_timeout_secs);
        let mut clients = Vec::new();
        {
            let mut pool = self.bridges.lock().unwrap_or_else(|p| p.into_inner());
            pool.retain(|transport, client| {
                let keep = config
                    .bridges
                    .values()
                    .any(|b| b.enabled && &b.transport == transport);
                if !keep {
                    info!(bridge = %client.name(), "Bridge removed from configuration");
                }
                keep
            });
            for (name, bridge) in config.bridges.iter().filter(|(_, b)| b.enabled) {
                let timeout = bridge
                    .timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout);
                let client = pool
                    .entry(bridge.transport.clone())
                    .or_insert_with(|| {
                        Arc::new(BridgeClient::new(
                            name,
                            connector_for(&bridge.transport),
                            timeout,
                        ))
                    })
                    .clone();
                clients.push((bridge.timeout_secs.map(Duration::from_secs), client));
            }
        }

        let mut tools = Vec::new();
        for (timeout, client) in clients {
            match client.list_tools().await {
                Ok(remote) => {
                    info!(bridge = %client.name(), tools = remote.len(), "Discovered bridged tools");
                    tools.extend(
                        remote
                            .into_iter()
                            .map(|info| bridged_descriptor(&client, info, timeout)),
                    );
                }
                Err(e) => warn!(bridge = %client.name(), "Bridge unavailable, its tools are skipped: {}", e),
            }
        }
        tools
    }

    /// Spawn a run for `question` and return immediately.
    pub fn start(&self, question: &str, options: RunOptions) -> RunHandle {
        let snapshot = self.snapshot.load();
        let run_id = Uuid::new_v4().to_string();
        let (sink, events) = EventSink::channel(snapshot.settings.event_buffer);
        let cancel = options.cancel.unwrap_or_default();
        let max_steps = options.max_steps.unwrap_or(snapshot.settings.max_steps);

        let ctx = RunContext {
            tool_timeout: Duration::from_secs(snapshot.settings.tool_timeout_secs),
            max_identical_calls: snapshot.settings.max_identical_calls,
            snapshot,
            collaborator: Arc::clone(&self.collaborator),
            events: sink.clone(),
            cancel: cancel.clone(),
        };
        let mut run = OrchestrationRun::new(run_id.clone(), question, max_steps);
        let join = tokio::spawn(async move {
            let report = drive(&mut run, &ctx).await;
            FinishedRun { run, report }
        });

        RunHandle {
            run_id,
            events,
            cancel,
            sink,
            join,
        }
    }

    /// Run `question` to completion.
    pub async fn ask(&self, question: &str, options: RunOptions) -> Result<FinishedRun, EngineError> {
        self.start(question, options).wait().await
    }
}

fn bridged_descriptor(
    client: &Arc<BridgeClient>,
    info: RemoteToolInfo,
    timeout: Option<Duration>,
) -> ToolDescriptor {
    let mut description = info
        .description
        .clone()
        .unwrap_or_else(|| format!("Tool '{}' provided by {}", info.name, client.name()));
    // Surface required parameters, which some servers only state in the schema
    if let Some(required) = info.input_schema.get("required").and_then(|r| r.as_array()) {
        let names: Vec<&str> = required.iter().filter_map(|v| v.as_str()).collect();
        if !names.is_empty() {
            description.push_str(&format!(" (required: {})", names.join(", ")));
        }
    }
    ToolDescriptor {
        name: info.name.clone(),
        description,
        input_schema: info.input_schema,
        provider: ToolProvider::Bridge {
            client: Arc::clone(client),
            remote_name: info.name,
            timeout,
        },
    }
}
