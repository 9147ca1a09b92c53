use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use kubediag::bridge::BridgeServer;
use kubediag::tools::handler;

/// Minimal bridge server for exercising bridge configuration end to end.
#[derive(Parser)]
#[command(name = "kubediag-test-tool")]
#[command(version)]
struct Args {
    /// Listen on this TCP address instead of serving stdio
    #[arg(long)]
    tcp: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol frames, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kubediag=info".parse()?))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let mut server = BridgeServer::new("kubediag-test-tool", env!("CARGO_PKG_VERSION"));
    server.register_tool(
        "test_tool",
        "A simple test tool that returns a fixed message",
        json!({ "type": "object", "properties": {} }),
        handler(|_| async { Ok("Hello from the kubediag test tool!".to_string()) }),
    );
    server.register_tool(
        "echo",
        "Echo the given message back",
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
            "required": ["message"]
        }),
        handler(|args| async move {
            Ok(args
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or_default()
                .to_string())
        }),
    );
    server.register_tool(
        "sleep",
        "Sleep for the given number of milliseconds, then answer",
        json!({
            "type": "object",
            "properties": { "millis": { "type": "integer", "minimum": 0 } }
        }),
        handler(|args| async move {
            let millis = args.get("millis").and_then(|m| m.as_u64()).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(format!("slept {}ms", millis))
        }),
    );

    let server = Arc::new(server);
    match args.tcp {
        Some(address) => server.serve_tcp(TcpListener::bind(&address).await?).await?,
        None => server.serve_stdio().await?,
    }
    Ok(())
}
