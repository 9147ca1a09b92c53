use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use kubediag::config::load_config;
use kubediag::environment::RuntimeEnvironment;
use kubediag::{Engine, RunOptions, StreamEvent};

#[derive(Parser)]
#[command(name = "kubediag")]
#[command(version)]
#[command(about = "Ask diagnostic questions about a Kubernetes cluster")]
struct Cli {
    /// Configuration file (defaults to CONFIG_FILE, then config/config.yaml)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Investigate a question and print the diagnosis
    Ask(AskArgs),
    /// List the tools available to the collaborator
    Tools,
    /// List runbooks in the catalog
    Runbooks,
}

#[derive(Parser)]
struct AskArgs {
    question: String,

    /// Tool-call budget for this run (1-100)
    #[arg(long)]
    max_steps: Option<u32>,

    /// Print progress while the run executes
    #[arg(long)]
    stream: bool,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("kubediag=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    tracing::info!(environment = RuntimeEnvironment::detect().as_str(), "Starting kubediag");
    let (config, path) = load_config(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Ask(args) => {
            let engine = Arc::new(Engine::from_config(config, path).await?);
            ask(&engine, args).await
        }
        Commands::Tools => {
            let engine = Engine::from_config(config, path).await?;
            for tool in engine.list_tools() {
                println!("{:<28} {:<20} {}", tool.name, tool.source, tool.description);
            }
            Ok(())
        }
        Commands::Runbooks => {
            let engine = Engine::from_config(config, path).await?;
            for entry in engine.runbooks() {
                let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
                println!("{:<32} {} [{}]", entry.link, entry.title, tags.join(", "));
            }
            Ok(())
        }
    }
}

async fn ask(engine: &Engine, args: AskArgs) -> anyhow::Result<()> {
    let handle = engine.start(
        &args.question,
        RunOptions {
            max_steps: args.max_steps,
            cancel: None,
        },
    );
    let cancel = handle.cancel_token();
    let (events, completion) = handle.into_parts();
    let printer = tokio::spawn(print_events(events, args.stream));

    let run = completion.wait();
    tokio::pin!(run);
    let finished = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling run...");
            cancel.cancel();
            (&mut run).await?
        }
        finished = &mut run => finished?,
    };
    let _ = printer.await;

    let report = finished.report;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.stream {
        match &report.result {
            Some(text) => println!("{}", text),
            None => println!("No answer: {}", report.error.as_deref().unwrap_or("unknown error")),
        }
    }
    if report.success {
        Ok(())
    } else {
        std::process::exit(1)
    }
}

async fn print_events(mut events: broadcast::Receiver<StreamEvent>, enabled: bool) {
    if !enabled {
        return;
    }
    loop {
        match events.recv().await {
            Ok(event) => {
                print!("{}", event.to_text());
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
}
