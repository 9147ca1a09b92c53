use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kubediag::api::run_server;
use kubediag::config::load_config;
use kubediag::environment::RuntimeEnvironment;
use kubediag::Engine;

#[derive(Parser)]
#[command(name = "kubediag-server")]
#[command(version)]
#[command(about = "Kubediag HTTP API")]
struct Args {
    /// Configuration file (defaults to CONFIG_FILE, then config/config.yaml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Overrides server.host from the configuration
    #[arg(long, env = "KUBEDIAG_HOST")]
    host: Option<String>,

    /// Overrides server.port from the configuration
    #[arg(long, env = "KUBEDIAG_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("kubediag=info".parse()?))
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let environment = RuntimeEnvironment::detect();
    tracing::info!(environment = environment.as_str(), "Starting kubediag-server");

    let (mut config, path) = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let server = config.server.clone();

    let engine = Arc::new(Engine::from_config(config, path).await?);
    run_server(engine, &server).await
}
