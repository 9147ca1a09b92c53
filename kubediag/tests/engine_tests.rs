use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use kubediag::bridge::{BridgeServer, Liveness};
use kubediag::config::{AppConfig, BridgeConfig, TransportConfig};
use kubediag::orchestrator::{Action, ScriptedCollaborator};
use kubediag::tools::handler;
use kubediag::{Engine, RunOptions, RunState};

async fn tcp_bridge() -> String {
    let mut server = BridgeServer::new("cluster-tools", "0.0.1");
    server.register_tool(
        "node_pressure",
        "Report node pressure conditions",
        json!({
            "type": "object",
            "properties": { "node": { "type": "string" } },
            "required": ["node"]
        }),
        handler(|args| async move {
            let node = args.get("node").and_then(|n| n.as_str()).unwrap_or("?");
            Ok(format!("{}: MemoryPressure=False DiskPressure=True", node))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(Arc::new(server).serve_tcp(listener));
    address
}

fn config_with_bridge(address: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.toolsets.kubernetes.enabled = false;
    config.catalog.dir = std::env::temp_dir().join("kubediag-no-catalog");
    config.bridges.insert(
        "cluster".to_string(),
        BridgeConfig {
            enabled: true,
            description: None,
            timeout_secs: Some(5),
            transport: TransportConfig::Tcp {
                address: address.to_string(),
            },
        },
    );
    config
}

#[tokio::test]
async fn test_bridged_tools_are_registered_and_callable() {
    let address = tcp_bridge().await;
    let engine = Engine::new(
        config_with_bridge(&address),
        Arc::new(ScriptedCollaborator::new(vec![
            Action::call("node_pressure", json!({ "node": "worker-1" })),
            Action::FinalAnswer("worker-1 is under disk pressure".to_string()),
        ])),
    )
    .await
    .unwrap();

    let tools = engine.list_tools();
    let bridged = tools.iter().find(|t| t.name == "node_pressure").unwrap();
    assert_eq!(bridged.source, "bridge:cluster");
    assert!(bridged.description.ends_with("(required: node)"));

    let finished = engine
        .ask("which node is unhealthy?", RunOptions::default())
        .await
        .unwrap();
    assert_eq!(finished.run.state, RunState::Completed);
    assert_eq!(
        finished.run.tool_calls().next().unwrap().outcome,
        Ok("worker-1: MemoryPressure=False DiskPressure=True".to_string())
    );

    let status = engine.bridge_status();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].liveness, Liveness::Connected);
    assert_eq!(status[0].connect_attempts, 1);
}

#[tokio::test]
async fn test_reload_reuses_bridge_connection() {
    let address = tcp_bridge().await;
    let engine = Engine::new(
        config_with_bridge(&address),
        Arc::new(ScriptedCollaborator::new(vec![])),
    )
    .await
    .unwrap();
    engine.reload(config_with_bridge(&address)).await.unwrap();
    assert_eq!(engine.bridge_status()[0].connect_attempts, 1);

    // removing the bridge drops its tools and its client
    let mut without = config_with_bridge(&address);
    without.bridges.clear();
    engine.reload(without).await.unwrap();
    assert!(engine.bridge_status().is_empty());
    assert!(engine.list_tools().iter().all(|t| t.name != "node_pressure"));
}

#[tokio::test]
async fn test_unreachable_bridge_is_skipped() {
    // bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let engine = tokio::time::timeout(
        Duration::from_secs(10),
        Engine::new(
            config_with_bridge(&address),
            Arc::new(ScriptedCollaborator::new(vec![])),
        ),
    )
    .await
    .expect("engine builds without waiting on the bridge")
    .unwrap();

    let names: Vec<String> = engine.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["fetch_runbook".to_string()]);
    assert_eq!(engine.bridge_status()[0].liveness, Liveness::Errored);
}
