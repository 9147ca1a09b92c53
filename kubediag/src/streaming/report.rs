use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::preview;
use crate::orchestrator::{OrchestrationRun, RunState, ToolCallStep};

/// Characters of each tool result kept in the report
pub const REPORT_RESULT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    /// Budget ran out; `result` holds the best-effort answer
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub iteration: u32,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub duration_ms: u64,
}

impl From<&ToolCallStep> for ToolCallRecord {
    fn from(step: &ToolCallStep) -> Self {
        let (status, result, error, error_kind) = match &step.outcome {
            Ok(text) => (
                ToolCallStatus::Success,
                Some(preview(text, REPORT_RESULT_CHARS)),
                None,
                None,
            ),
            Err(e) => (
                ToolCallStatus::Error,
                None,
                Some(e.to_string()),
                Some(e.kind().to_string()),
            ),
        };
        Self {
            call_id: step.call_id.clone(),
            iteration: step.iteration,
            tool_name: step.tool.clone(),
            arguments: step.arguments.clone(),
            status,
            result,
            error,
            error_kind,
            duration_ms: step.latency.as_millis() as u64,
        }
    }
}

/// Synchronous result of a run, derived from its transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub success: bool,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub steps_used: u32,
    pub max_steps: u32,
    /// Wall-clock seconds
    pub execution_time: f64,
    pub timestamp: DateTime<Utc>,
}

impl RunReport {
    pub fn from_run(run: &OrchestrationRun) -> Self {
        let tool_calls: Vec<ToolCallRecord> = run.tool_calls().map(ToolCallRecord::from).collect();
        let (outcome, error) = match &run.state {
            RunState::Completed => (RunOutcome::Completed, None),
            RunState::BudgetExhausted(reason) => (RunOutcome::Partial, Some(reason.to_string())),
            RunState::Failed(err) => (RunOutcome::Failed, Some(err.to_string())),
            RunState::Init | RunState::Stepping => (
                RunOutcome::Failed,
                Some(format!("run not finished ({})", run.state.as_str())),
            ),
        };
        Self {
            run_id: run.run_id.clone(),
            success: outcome == RunOutcome::Completed,
            outcome,
            result: run.final_text.clone(),
            error,
            steps_used: tool_calls.len() as u32,
            tool_calls,
            max_steps: run.max_steps,
            execution_time: run.elapsed.as_secs_f64(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RunError, ToolError};
    use crate::orchestrator::{ExhaustionReason, Step};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn call(id: &str, outcome: Result<String, ToolError>) -> Step {
        Step::ToolCall(ToolCallStep {
            call_id: id.to_string(),
            iteration: 1,
            tool: "kubectl_get".to_string(),
            arguments: json!({ "resource": "pods" }),
            outcome,
            latency: Duration::from_millis(5),
        })
    }

    #[test]
    fn partial_report_keeps_failed_attempts() {
        let mut run = OrchestrationRun::new("run-1", "why is api down?", 2);
        run.transcript = vec![
            Step::Reasoning {
                text: "check pods".to_string(),
            },
            call("c1", Ok("api-0 CrashLoopBackOff".to_string())),
            call(
                "c2",
                Err(ToolError::Timeout {
                    tool: "kubectl_get".to_string(),
                    after: Duration::from_secs(1),
                }),
            ),
        ];
        run.state = RunState::BudgetExhausted(ExhaustionReason::StepLimit { limit: 2 });
        run.final_text = Some("api-0 is crash looping".to_string());

        let report = RunReport::from_run(&run);
        assert!(!report.success);
        assert_eq!(report.outcome, RunOutcome::Partial);
        assert_eq!(report.steps_used, 2);
        assert_eq!(
            report.tool_calls.iter().map(|c| c.status).collect::<Vec<_>>(),
            vec![ToolCallStatus::Success, ToolCallStatus::Error]
        );
        assert_eq!(report.tool_calls[1].error_kind.as_deref(), Some("timeout"));
        assert_eq!(report.result.as_deref(), Some("api-0 is crash looping"));
    }

    #[test]
    fn failed_report_surfaces_reason_verbatim() {
        let mut run = OrchestrationRun::new("run-2", "q", 5);
        run.state = RunState::Failed(RunError::Cancelled);
        let report = RunReport::from_run(&run);
        assert_eq!(report.outcome, RunOutcome::Failed);
        assert_eq!(report.error.as_deref(), Some("cancelled"));
        let encoded = serde_json::to_value(&report).unwrap();
        assert_eq!(encoded["outcome"], "failed");
        assert!(encoded.get("result").is_none());
    }
}
