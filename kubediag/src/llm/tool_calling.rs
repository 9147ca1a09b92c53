use serde_json::{json, Value};

use crate::catalog::CatalogEntry;
use crate::orchestrator::{Step, ToolCallRequest};
use crate::tools::ToolSpec;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a Kubernetes diagnostics assistant. \
Investigate the operator's question by calling the available tools, one small step at a time. \
Prefer read-only queries, check events and logs before drawing conclusions, and consult a runbook \
with fetch_runbook when one matches the symptoms. When you have enough evidence, answer with a \
concise diagnosis: root cause, supporting evidence, and recommended next actions.";

pub fn tool_spec_to_openai_json(spec: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.input_schema,
        }
    })
}

pub fn runbook_menu(runbooks: &[CatalogEntry]) -> String {
    if runbooks.is_empty() {
        return String::new();
    }
    let mut out = String::from("\n\nAvailable runbooks (read one with fetch_runbook using its link):\n");
    for entry in runbooks {
        let tags = entry.tags.iter().cloned().collect::<Vec<_>>().join(", ");
        out.push_str(&format!(
            "- {} [{}]: {} (tags: {})\n",
            entry.title, entry.link, entry.description, tags
        ));
    }
    out
}

/// Render the transcript as chat messages.
///
/// Tool calls of one iteration become a single assistant message carrying
/// the preceding reasoning, followed by one `tool` message per call.
pub fn transcript_to_messages(transcript: &[Step]) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut i = 0;
    while i < transcript.len() {
        let mut content = String::new();
        if let Step::Reasoning { text } = &transcript[i] {
            content = text.clone();
            i += 1;
        }

        let iteration = transcript
            .get(i)
            .and_then(Step::as_tool_call)
            .map(|c| c.iteration);
        let mut calls = Vec::new();
        while let Some(call) = transcript.get(i).and_then(Step::as_tool_call) {
            if Some(call.iteration) != iteration {
                break;
            }
            calls.push(call);
            i += 1;
        }

        if calls.is_empty() {
            messages.push(json!({ "role": "assistant", "content": content }));
            continue;
        }
        let tool_calls: Vec<Value> = calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.call_id,
                    "type": "function",
                    "function": { "name": c.tool, "arguments": c.arguments.to_string() }
                })
            })
            .collect();
        messages.push(json!({
            "role": "assistant",
            "content": content,
            "tool_calls": tool_calls
        }));
        for call in calls {
            let body = match &call.outcome {
                Ok(text) => text.clone(),
                Err(e) => format!("Error: {}", e),
            };
            messages.push(json!({
                "role": "tool",
                "tool_call_id": call.call_id,
                "content": body
            }));
        }
    }
    messages
}

pub fn extract_openai_assistant_content(response_json: &Value) -> String {
    response_json["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

pub fn extract_openai_tool_calls(response_json: &Value) -> Vec<ToolCallRequest> {
    let Some(tool_calls) = response_json["choices"][0]["message"]["tool_calls"].as_array() else {
        return Vec::new();
    };

    tool_calls
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let tool = item["function"]["name"].as_str()?.to_string();
            let id = item["id"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("tool_call_{}", idx + 1));

            let raw_args = item["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments = match serde_json::from_str::<Value>(raw_args) {
                Ok(v) => v,
                Err(_) => json!({ "raw_arguments": raw_args }),
            };

            Some(ToolCallRequest {
                id: Some(id),
                tool,
                arguments,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::orchestrator::ToolCallStep;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn call(id: &str, iteration: u32, outcome: Result<String, ToolError>) -> Step {
        Step::ToolCall(ToolCallStep {
            call_id: id.to_string(),
            iteration,
            tool: "kubectl_get".to_string(),
            arguments: json!({ "resource": "pods" }),
            outcome,
            latency: Duration::from_millis(1),
        })
    }

    #[test]
    fn groups_calls_by_iteration() {
        let transcript = vec![
            Step::Reasoning {
                text: "look at pods".to_string(),
            },
            call("a", 1, Ok("pod list".to_string())),
            call("b", 1, Err(ToolError::UnknownTool("nope".to_string()))),
            call("c", 2, Ok("more".to_string())),
        ];
        let messages = transcript_to_messages(&transcript);
        let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["assistant", "tool", "tool", "assistant", "tool"]);
        assert_eq!(messages[0]["content"], "look at pods");
        assert_eq!(messages[0]["tool_calls"].as_array().unwrap().len(), 2);
        assert_eq!(messages[2]["content"], "Error: Unknown tool: nope");
        assert_eq!(messages[3]["content"], "");
    }

    #[test]
    fn extracts_tool_calls_and_tolerates_bad_arguments() {
        let response = json!({
            "choices": [{
                "message": {
                    "content": "checking",
                    "tool_calls": [
                        {"id": "x1", "function": {"name": "kubectl_get", "arguments": "{\"resource\":\"pods\"}"}},
                        {"function": {"name": "kubectl_logs", "arguments": "not json"}}
                    ]
                }
            }]
        });
        let calls = extract_openai_tool_calls(&response);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id.as_deref(), Some("x1"));
        assert_eq!(calls[0].arguments, json!({ "resource": "pods" }));
        assert_eq!(calls[1].id.as_deref(), Some("tool_call_2"));
        assert_eq!(calls[1].arguments, json!({ "raw_arguments": "not json" }));
        assert_eq!(extract_openai_assistant_content(&response), "checking");
    }
}
