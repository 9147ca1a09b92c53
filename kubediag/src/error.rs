//! Error taxonomy shared across the engine.
//!
//! Tool-level errors ([`ToolError`]) are recorded in the transcript and fed
//! back to the collaborator. Run-level failures are carried by
//! [`crate::orchestrator::RunState::Failed`].

use std::time::Duration;
use thiserror::Error;

/// Errors produced by a single tool invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Tool '{tool}' timed out after {}ms", .after.as_millis())]
    Timeout { tool: String, after: Duration },

    #[error("Remote fault: {0}")]
    RemoteFault(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

impl ToolError {
    /// Short machine-readable tag used in reports and stream events.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::DocumentNotFound(_) => "document_not_found",
            ToolError::Timeout { .. } => "timeout",
            ToolError::RemoteFault(_) => "remote_fault",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::ExecutionFailed(_) => "execution_failed",
        }
    }
}

/// Errors raised while building a tool registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("Duplicate tool name: {0}")]
    DuplicateToolName(String),

    #[error("Invalid tool name '{0}': must match ^[A-Za-z0-9_-]+$")]
    InvalidToolName(String),
}

/// Errors raised by the reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CollaboratorError {
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed collaborator response: {0}")]
    Malformed(String),
}

/// Unrecoverable conditions that end a run as failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunError {
    #[error("cancelled")]
    Cancelled,

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_reports_milliseconds() {
        let err = ToolError::Timeout {
            tool: "kubectl_get".to_string(),
            after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Tool 'kubectl_get' timed out after 1500ms");
        assert_eq!(err.kind(), "timeout");
    }
}
