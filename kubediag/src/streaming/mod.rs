//! Result aggregation and incremental streaming
//!
//! Every transcript step is projected into a [`StreamEvent`] and published on
//! a per-run broadcast channel. Delivery is best-effort: a slow or departed
//! subscriber never blocks the run. The same steps feed the synchronous
//! [`RunReport`].

pub mod report;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::orchestrator::ToolCallStep;

pub use report::{RunOutcome, RunReport, ToolCallRecord, ToolCallStatus};

/// Characters of a tool result carried by a `tool_result` event
pub const STREAM_PREVIEW_CHARS: usize = 300;

/// Events streamed to subscribers of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    RunStarted {
        run_id: String,
        question: String,
        max_steps: u32,
        timestamp: DateTime<Utc>,
    },
    Reasoning {
        run_id: String,
        text: String,
    },
    ToolInvoked {
        run_id: String,
        call_id: String,
        iteration: u32,
        tool: String,
        arguments: Value,
    },
    ToolResult {
        run_id: String,
        call_id: String,
        tool: String,
        status: ToolCallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<String>,
        result_preview: String,
        duration_ms: u64,
    },
    FinalAnswer {
        run_id: String,
        text: String,
        /// Set when the answer was produced after the budget ran out
        partial: bool,
    },
    RunFinished {
        run_id: String,
        report: RunReport,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::RunStarted { .. } => "run_started",
            StreamEvent::Reasoning { .. } => "reasoning",
            StreamEvent::ToolInvoked { .. } => "tool_invoked",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::FinalAnswer { .. } => "final_answer",
            StreamEvent::RunFinished { .. } => "run_finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::RunFinished { .. })
    }

    pub fn tool_result(run_id: &str, step: &ToolCallStep) -> Self {
        let (status, error_kind, text) = match &step.outcome {
            Ok(text) => (ToolCallStatus::Success, None, text.clone()),
            Err(e) => (ToolCallStatus::Error, Some(e.kind().to_string()), e.to_string()),
        };
        StreamEvent::ToolResult {
            run_id: run_id.to_string(),
            call_id: step.call_id.clone(),
            tool: step.tool.clone(),
            status,
            error_kind,
            result_preview: preview(&text, STREAM_PREVIEW_CHARS),
            duration_ms: step.latency.as_millis() as u64,
        }
    }

    /// Server-sent events frame
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }

    /// One or more human-readable lines, newline terminated
    pub fn to_text(&self) -> String {
        match self {
            StreamEvent::RunStarted {
                question, max_steps, ..
            } => format!("Question: {}\nStep budget: {}\n", question, max_steps),
            StreamEvent::Reasoning { text, .. } => format!("[reasoning] {}\n", text.trim()),
            StreamEvent::ToolInvoked {
                tool, arguments, ..
            } => format!("[tool] {} {}\n", tool, arguments),
            StreamEvent::ToolResult {
                tool,
                status,
                result_preview,
                duration_ms,
                ..
            } => format!(
                "[result] {} {} in {}: {}\n",
                tool,
                status.as_str(),
                format_duration(Duration::from_millis(*duration_ms)),
                result_preview
            ),
            StreamEvent::FinalAnswer { text, partial, .. } => {
                if *partial {
                    format!("\n[partial answer]\n{}\n", text)
                } else {
                    format!("\n[answer]\n{}\n", text)
                }
            }
            StreamEvent::RunFinished { report, .. } => format!(
                "[done] {} after {} tool calls in {}{}\n",
                report.outcome.as_str(),
                report.tool_calls.len(),
                format_duration(Duration::from_secs_f64(report.execution_time)),
                report
                    .error
                    .as_ref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ),
        }
    }
}

/// Publishing half of a run's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<broadcast::Sender<StreamEvent>>,
}

impl EventSink {
    pub fn new(tx: broadcast::Sender<StreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Create a sink plus its first subscriber.
    pub fn channel(capacity: usize) -> (Self, broadcast::Receiver<StreamEvent>) {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<StreamEvent>> {
        self.tx.as_ref().map(|tx| tx.subscribe())
    }

    pub fn emit(&self, event: StreamEvent) {
        if let Some(tx) = &self.tx {
            // No receivers is fine; the run continues unobserved
            let _ = tx.send(event);
        }
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}

/// `850ms`, `12.3s` or `2m 5.0s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let minutes = (secs / 60.0).floor();
        format!("{}m {:.1}s", minutes as u64, secs - minutes * 60.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use serde_json::json;

    #[test]
    fn durations_are_humanized() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(12_340)), "12.3s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5.0s");
    }

    #[test]
    fn tool_result_event_is_tagged_and_previewed() {
        let step = ToolCallStep {
            call_id: "call_1".to_string(),
            iteration: 1,
            tool: "kubectl_logs".to_string(),
            arguments: json!({ "pod": "api-0" }),
            outcome: Err(ToolError::RemoteFault("boom".to_string())),
            latency: Duration::from_millis(42),
        };
        let event = StreamEvent::tool_result("run-1", &step);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "tool_result");
        assert_eq!(value["status"], "error");
        assert_eq!(value["error_kind"], "remote_fault");
        assert_eq!(value["duration_ms"], 42);

        let sse = event.to_sse();
        assert!(sse.starts_with("event: tool_result\ndata: {"));
        assert!(sse.ends_with("\n\n"));
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(StreamEvent::Reasoning {
            run_id: "r".to_string(),
            text: "thinking".to_string(),
        });
        EventSink::disabled().emit(StreamEvent::Reasoning {
            run_id: "r".to_string(),
            text: "ignored".to_string(),
        });
    }

    #[test]
    fn preview_cuts_on_char_boundaries() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 10), "short");
    }
}
