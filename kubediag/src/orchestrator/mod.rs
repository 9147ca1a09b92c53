//! Orchestration loop
//!
//! A run moves through `Init -> Stepping -> {Completed | BudgetExhausted | Failed}`.
//! Each `Stepping` iteration asks the collaborator for one action, dispatches
//! the requested tool calls concurrently and waits for all of them before
//! asking again. The transcript is append-only and is the only state the
//! collaborator sees.

pub mod collaborator;
pub mod run_loop;
pub mod scripted;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use crate::error::{RunError, ToolError};

pub use collaborator::{Action, Collaborator, DecisionRequest, ToolCallRequest};
pub use run_loop::{drive, RunContext};
pub use scripted::ScriptedCollaborator;

/// Why a run stopped before the collaborator produced a final answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExhaustionReason {
    StepLimit { limit: u32 },
    RepeatedCall { tool: String, times: u32 },
}

impl std::fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExhaustionReason::StepLimit { limit } => {
                write!(f, "step budget of {} tool calls exhausted", limit)
            }
            ExhaustionReason::RepeatedCall { tool, times } => write!(
                f,
                "repeated identical tool call: '{}' already issued {} times with the same arguments",
                tool, times
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Init,
    Stepping,
    Completed,
    BudgetExhausted(ExhaustionReason),
    Failed(RunError),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::BudgetExhausted(_) | RunState::Failed(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Stepping => "running",
            RunState::Completed => "completed",
            RunState::BudgetExhausted(_) => "budget_exhausted",
            RunState::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallStep {
    pub call_id: String,
    /// Stepping iteration that issued the call, starting at 1
    pub iteration: u32,
    pub tool: String,
    pub arguments: Value,
    pub outcome: Result<String, ToolError>,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Reasoning { text: String },
    ToolCall(ToolCallStep),
}

impl Step {
    pub fn as_tool_call(&self) -> Option<&ToolCallStep> {
        match self {
            Step::ToolCall(call) => Some(call),
            Step::Reasoning { .. } => None,
        }
    }
}

/// One question's journey through the loop. Never reused once terminal.
#[derive(Debug, Clone)]
pub struct OrchestrationRun {
    pub run_id: String,
    pub question: String,
    /// Step budget after clamping
    pub max_steps: u32,
    pub transcript: Vec<Step>,
    pub state: RunState,
    pub final_text: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl OrchestrationRun {
    pub fn new(run_id: impl Into<String>, question: impl Into<String>, max_steps: u32) -> Self {
        Self {
            run_id: run_id.into(),
            question: question.into(),
            max_steps,
            transcript: Vec::new(),
            state: RunState::Init,
            final_text: None,
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallStep> {
        self.transcript.iter().filter_map(Step::as_tool_call)
    }

    pub fn tool_call_count(&self) -> usize {
        self.tool_calls().count()
    }
}
