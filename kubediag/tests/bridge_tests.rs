mod common;

use async_trait::async_trait;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{echo_server, engine_with, settings, DuplexConnector};
use kubediag::bridge::{BridgeClient, Connector, Liveness, RawLink, TransportError};
use kubediag::orchestrator::{Action, ScriptedCollaborator};
use kubediag::tools::{ToolDescriptor, ToolProvider};
use kubediag::{RunError, RunOptions, RunState, ToolError};

const TIMEOUT: Duration = Duration::from_secs(5);

fn client_for(connector: &Arc<DuplexConnector>) -> BridgeClient {
    BridgeClient::new("test-bridge", connector.clone(), TIMEOUT)
}

async fn wait_until_disconnected(client: &BridgeClient) {
    for _ in 0..100 {
        if client.liveness() != Liveness::Connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge never noticed the disconnect");
}

#[tokio::test]
async fn test_discovery_connects_lazily() {
    let connector = DuplexConnector::new(echo_server());
    let client = client_for(&connector);
    assert_eq!(client.liveness(), Liveness::Disconnected);
    assert_eq!(client.connect_attempts(), 0);

    let tools = client.list_tools().await.expect("discovery");
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "delayed_echo"]);
    assert_eq!(tools[0].input_schema["required"], json!(["message"]));
    assert_eq!(client.liveness(), Liveness::Connected);

    // listing again reuses the connection
    client.list_tools().await.unwrap();
    assert_eq!(client.connect_attempts(), 1);
}

#[tokio::test]
async fn test_invoke_round_trip() {
    let connector = DuplexConnector::new(echo_server());
    let client = client_for(&connector);
    let text = client
        .invoke("echo", json!({ "message": "pods are fine" }), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(text, "pods are fine");
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_unknown_remote_tool_is_remote_fault() {
    let connector = DuplexConnector::new(echo_server());
    let client = client_for(&connector);
    let err = client.invoke("nope", json!({}), TIMEOUT).await.unwrap_err();
    assert!(matches!(err, ToolError::RemoteFault(msg) if msg.contains("Unknown tool")));
    // a fault from the server does not cost the connection
    assert_eq!(client.liveness(), Liveness::Connected);
}

#[tokio::test]
async fn test_concurrent_calls_are_demultiplexed() {
    let connector = DuplexConnector::new(echo_server());
    let client = Arc::new(client_for(&connector));

    // later calls finish first
    let calls = (0..10u64).map(|i| {
        let client = Arc::clone(&client);
        async move {
            client
                .invoke(
                    "delayed_echo",
                    json!({ "message": format!("call {}", i), "millis": (10 - i) * 20 }),
                    TIMEOUT,
                )
                .await
        }
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), format!("call {}", i));
    }
    assert_eq!(client.connect_attempts(), 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_timeout_keeps_connection_and_discards_late_reply() {
    let connector = DuplexConnector::new(echo_server());
    let client = client_for(&connector);

    let err = client
        .invoke(
            "delayed_echo",
            json!({ "message": "late", "millis": 300 }),
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { .. }));
    assert_eq!(client.in_flight(), 0);

    // let the late reply arrive and be dropped
    tokio::time::sleep(Duration::from_millis(400)).await;
    let text = client
        .invoke("echo", json!({ "message": "on time" }), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(text, "on time");
    assert_eq!(client.connect_attempts(), 1);
    assert_eq!(client.liveness(), Liveness::Connected);
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_then_reconnects_once() {
    let connector = DuplexConnector::new(echo_server());
    let client = Arc::new(client_for(&connector));
    client.list_tools().await.unwrap();

    let in_flight = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .invoke(
                    "delayed_echo",
                    json!({ "message": "never", "millis": 10_000 }),
                    TIMEOUT,
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    connector.kill_sessions();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ToolError::RemoteFault(_)), "got {:?}", err);
    wait_until_disconnected(&client).await;
    assert_eq!(client.liveness(), Liveness::Disconnected);

    let text = client
        .invoke("echo", json!({ "message": "back" }), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(text, "back");
    assert_eq!(client.connect_attempts(), 2);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_bridged_descriptor_maps_timeout_to_local_name() {
    let connector = DuplexConnector::new(echo_server());
    let client = Arc::new(client_for(&connector));
    let descriptor = ToolDescriptor {
        name: "slow_echo".to_string(),
        description: "bridged".to_string(),
        input_schema: json!({ "type": "object" }),
        provider: ToolProvider::Bridge {
            client: Arc::clone(&client),
            remote_name: "delayed_echo".to_string(),
            timeout: Some(Duration::from_millis(30)),
        },
    };
    assert_eq!(descriptor.source(), "bridge:test-bridge");

    let err = descriptor
        .invoke(json!({ "message": "x", "millis": 500 }), TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, ToolError::Timeout { tool, .. } if tool == "slow_echo"));
}

/// A server that never accepts the connection.
struct BlackholeConnector;

#[async_trait]
impl Connector for BlackholeConnector {
    async fn connect(&self) -> Result<RawLink, TransportError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(TransportError::MissingPipe("stdout"))
    }

    fn endpoint(&self) -> String {
        "blackhole://test".to_string()
    }
}

#[tokio::test]
async fn test_call_deadline_covers_connection_setup() {
    let client = Arc::new(BridgeClient::new(
        "blackhole",
        Arc::new(BlackholeConnector),
        Duration::from_secs(20),
    ));

    let started = Instant::now();
    let calls = (0..3).map(|_| {
        let client = Arc::clone(&client);
        async move {
            client
                .invoke("echo", json!({}), Duration::from_millis(100))
                .await
        }
    });
    let results = join_all(calls).await;

    assert!(started.elapsed() < Duration::from_secs(2));
    for result in results {
        assert!(
            matches!(&result, Err(ToolError::Timeout { tool, .. }) if tool == "echo"),
            "got {:?}",
            result
        );
    }
}

#[tokio::test]
async fn test_connect_is_bounded_by_handshake_timeout() {
    let client = BridgeClient::new(
        "blackhole",
        Arc::new(BlackholeConnector),
        Duration::from_millis(100),
    );

    let started = Instant::now();
    let err = client.list_tools().await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(err, ToolError::RemoteFault(_)), "got {:?}", err);
    assert_eq!(client.liveness(), Liveness::Errored);
    assert_eq!(client.connect_attempts(), 1);
}

#[tokio::test]
async fn test_cancelled_bridged_call_releases_pending_entry() {
    let connector = DuplexConnector::new(echo_server());
    let client = Arc::new(client_for(&connector));
    let descriptor = ToolDescriptor {
        name: "delayed_echo".to_string(),
        description: "bridged".to_string(),
        input_schema: json!({ "type": "object" }),
        provider: ToolProvider::Bridge {
            client: Arc::clone(&client),
            remote_name: "delayed_echo".to_string(),
            timeout: None,
        },
    };
    let engine = engine_with(
        vec![descriptor],
        settings(10),
        Arc::new(ScriptedCollaborator::repeating(Action::call(
            "delayed_echo",
            json!({ "message": "slow", "millis": 10_000 }),
        ))),
    );

    let handle = engine.start("wait on the bridge", RunOptions::default());
    let cancel = handle.cancel_token();
    let (mut events, completion) = handle.into_parts();
    while events.recv().await.unwrap().name() != "tool_invoked" {}
    for _ in 0..100 {
        if client.in_flight() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.in_flight(), 1);

    cancel.cancel();
    let finished = completion.wait().await.unwrap();
    assert_eq!(finished.run.state, RunState::Failed(RunError::Cancelled));
    assert_eq!(client.in_flight(), 0);

    // the connection survives the abandoned call
    let text = client
        .invoke("echo", json!({ "message": "still here" }), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(text, "still here");
    assert_eq!(client.connect_attempts(), 1);
    assert_eq!(client.liveness(), Liveness::Connected);
}
