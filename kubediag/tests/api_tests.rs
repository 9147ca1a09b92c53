#![cfg(feature = "server")]

mod common;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use common::{engine_with, settings, slow_tool};
use kubediag::api::{router, AppState, RUN_ID_HEADER};
use kubediag::orchestrator::{Action, ScriptedCollaborator};
use kubediag::Engine;

async fn serve(engine: Engine) -> String {
    let state = Arc::new(AppState::new(Arc::new(engine)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(state)).await });
    format!("http://{}", address)
}

fn three_probes() -> Engine {
    let mut script: Vec<Action> = (1..=3)
        .map(|n| Action::call("probe", json!({ "n": n })))
        .collect();
    script.push(Action::FinalAnswer("probed three times".to_string()));
    engine_with(
        vec![slow_tool("probe", 100)],
        settings(10),
        Arc::new(ScriptedCollaborator::new(script)),
    )
}

async fn wait_for_report(client: &reqwest::Client, base: &str, run_id: &str) -> Value {
    for _ in 0..100 {
        let record: Value = client
            .get(format!("{}/api/v1/runs/{}", base, run_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if record["status"] == "finished" {
            return record["report"].clone();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {} never finished", run_id);
}

#[tokio::test]
async fn test_streamed_run_report_survives_disconnect() {
    let base = serve(three_probes()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/query/stream", base))
        .json(&json!({ "question": "probe it", "output_format": "text" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let run_id = response
        .headers()
        .get(RUN_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    drop(response);

    let report = wait_for_report(&client, &base, &run_id).await;
    assert_eq!(report["run_id"], run_id.as_str());
    assert_eq!(report["outcome"], "completed");
    assert_eq!(report["result"], "probed three times");
    assert_eq!(report["tool_calls"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_async_query_is_retrievable() {
    let base = serve(three_probes()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/query/async", base))
        .json(&json!({ "question": "probe it later" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["status"], "running");
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    let report = wait_for_report(&client, &base, &run_id).await;
    assert_eq!(report["success"], true);
    assert_eq!(report["steps_used"], 3);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let base = serve(three_probes()).await;
    let response = reqwest::Client::new()
        .get(format!("{}/api/v1/runs/{}", base, "no-such-run"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
