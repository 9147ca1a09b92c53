#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::task::AbortHandle;

use kubediag::bridge::{BridgeServer, Connector, RawLink, TransportError};
use kubediag::catalog::CatalogIndex;
use kubediag::config::EngineConfig;
use kubediag::orchestrator::Collaborator;
use kubediag::snapshot::EngineSnapshot;
use kubediag::tools::{handler, ToolDescriptor, ToolRegistry};
use kubediag::{Engine, StreamEvent};

/// Connects a bridge client to an in-process [`BridgeServer`] over a duplex pipe.
pub struct DuplexConnector {
    server: Arc<BridgeServer>,
    sessions: Mutex<Vec<AbortHandle>>,
    pub connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new(server: BridgeServer) -> Arc<Self> {
        Arc::new(Self {
            server: Arc::new(server),
            sessions: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
        })
    }

    /// Kill every live server session, as if the remote process died.
    pub fn kill_sessions(&self) {
        for session in self.sessions.lock().unwrap().drain(..) {
            session.abort();
        }
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> Result<RawLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (client_end, server_end) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server_end);
        let server = Arc::clone(&self.server);
        let session = tokio::spawn(async move {
            let _ = server.serve(server_read, server_write).await;
        });
        self.sessions.lock().unwrap().push(session.abort_handle());

        let (client_read, client_write) = tokio::io::split(client_end);
        Ok(RawLink {
            reader: Box::new(BufReader::new(client_read)),
            writer: Box::new(client_write),
            child: None,
        })
    }

    fn endpoint(&self) -> String {
        "duplex://test".to_string()
    }
}

/// Bridge server with `echo` and `delayed_echo` tools.
pub fn echo_server() -> BridgeServer {
    let mut server = BridgeServer::new("test-bridge", "0.0.1");
    server.register_tool(
        "echo",
        "Echo the message",
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
            "required": ["message"]
        }),
        handler(|args| async move { Ok(message_of(&args)) }),
    );
    server.register_tool(
        "delayed_echo",
        "Echo the message after a delay",
        json!({
            "type": "object",
            "properties": {
                "message": { "type": "string" },
                "millis": { "type": "integer" }
            }
        }),
        handler(|args| async move {
            let millis = args.get("millis").and_then(|m| m.as_u64()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(message_of(&args))
        }),
    );
    server
}

fn message_of(args: &Value) -> String {
    args.get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Local tool that answers `"<name>: <arguments>"`.
pub fn echo_tool(name: &str) -> ToolDescriptor {
    let label = name.to_string();
    ToolDescriptor::local(
        name,
        "Echo the arguments",
        json!({ "type": "object" }),
        handler(move |args| {
            let label = label.clone();
            async move { Ok(format!("{}: {}", label, args)) }
        }),
    )
}

/// Local tool that sleeps for `millis` before answering.
pub fn slow_tool(name: &str, millis: u64) -> ToolDescriptor {
    ToolDescriptor::local(
        name,
        "Answer slowly",
        json!({ "type": "object" }),
        handler(move |_| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok("done".to_string())
        }),
    )
}

pub fn settings(max_steps: u32) -> EngineConfig {
    EngineConfig {
        max_steps,
        ..EngineConfig::default()
    }
}

pub fn snapshot_with(tools: Vec<ToolDescriptor>, settings: EngineConfig) -> EngineSnapshot {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).expect("register test tool");
    }
    EngineSnapshot::new(registry, Arc::new(CatalogIndex::empty()), settings)
}

pub fn engine_with(
    tools: Vec<ToolDescriptor>,
    settings: EngineConfig,
    collaborator: Arc<dyn Collaborator>,
) -> Engine {
    Engine::with_snapshot(snapshot_with(tools, settings), collaborator)
}

/// Drain a receiver until the terminal event.
pub async fn collect_events(
    mut events: tokio::sync::broadcast::Receiver<StreamEvent>,
) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}
