// Kubediag Library
// Diagnostic orchestration engine: tool registry, bridges, runbook catalog and the step loop

pub mod bridge;
pub mod budget;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod environment;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod snapshot;
pub mod streaming;
pub mod tools;

#[cfg(feature = "server")]
pub mod api;

pub use engine::{Engine, RunHandle, RunOptions};
pub use error::{CollaboratorError, RegistryError, RunError, ToolError};
pub use orchestrator::{OrchestrationRun, RunState, Step};
pub use streaming::{RunReport, StreamEvent};
