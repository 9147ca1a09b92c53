use async_trait::async_trait;
use serde_json::Value;

use super::Step;
use crate::catalog::CatalogEntry;
use crate::error::CollaboratorError;
use crate::tools::ToolSpec;

/// Everything the collaborator may consult when choosing the next action.
#[derive(Debug, Clone, Copy)]
pub struct DecisionRequest<'a> {
    pub run_id: &'a str,
    pub question: &'a str,
    pub transcript: &'a [Step],
    pub tools: &'a [ToolSpec],
    pub runbooks: &'a [CatalogEntry],
    /// Zero means the budget is spent and only a concluding answer is wanted
    pub remaining_steps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Collaborator-assigned id; the loop generates one when absent
    pub id: Option<String>,
    pub tool: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(tool: &str, arguments: Value) -> Self {
        Self {
            id: None,
            tool: tool.to_string(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    FinalAnswer(String),
    ToolCalls {
        reasoning: Option<String>,
        calls: Vec<ToolCallRequest>,
    },
}

impl Action {
    pub fn call(tool: &str, arguments: Value) -> Self {
        Action::ToolCalls {
            reasoning: None,
            calls: vec![ToolCallRequest::new(tool, arguments)],
        }
    }
}

/// The external decision maker driving a run.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Action, CollaboratorError>;
}
