use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

use super::tool_calling::{
    extract_openai_assistant_content, extract_openai_tool_calls, runbook_menu,
    tool_spec_to_openai_json, transcript_to_messages, DEFAULT_SYSTEM_PROMPT,
};
use crate::config::LlmConfig;
use crate::error::CollaboratorError;
use crate::orchestrator::{Action, Collaborator, DecisionRequest};

const CONCLUDE_PROMPT: &str = "The tool-call budget for this investigation is spent. \
Do not request more tools. Give your best diagnosis from the evidence above and state \
clearly what remains unverified.";

pub struct OpenAiCollaborator {
    client: Client,
    config: LlmConfig,
    api_key: Option<String>,
    url: String,
    model: String,
}

impl std::fmt::Debug for OpenAiCollaborator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCollaborator")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}

impl OpenAiCollaborator {
    pub fn new(config: LlmConfig) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CollaboratorError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        let base_url = config
            .base_url
            .as_ref()
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| match config.provider.as_str() {
                "deepseek" => "https://api.deepseek.com/v1".to_string(),
                _ => "https://api.openai.com/v1".to_string(),
            });
        // Routing-style names like "deepseek/deepseek-chat" carry the provider as a prefix
        let model = config
            .model
            .strip_prefix(&format!("{}/", config.provider))
            .unwrap_or(&config.model)
            .to_string();

        Ok(Self {
            client,
            api_key: config.resolved_api_key(),
            url: format!("{}/chat/completions", base_url),
            model,
            config,
        })
    }

    fn build_body(&self, request: &DecisionRequest<'_>) -> Value {
        let system_prompt = format!(
            "{}{}",
            self.config
                .system_prompt
                .as_deref()
                .unwrap_or(DEFAULT_SYSTEM_PROMPT),
            runbook_menu(request.runbooks)
        );

        let mut messages = vec![
            json!({ "role": "system", "content": system_prompt }),
            json!({ "role": "user", "content": request.question }),
        ];
        messages.extend(transcript_to_messages(request.transcript));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if request.remaining_steps == 0 {
            if let Some(list) = body["messages"].as_array_mut() {
                list.push(json!({ "role": "user", "content": CONCLUDE_PROMPT }));
            }
        } else if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(tool_spec_to_openai_json).collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(t) = self.config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.config.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[async_trait]
impl Collaborator for OpenAiCollaborator {
    async fn decide(&self, request: DecisionRequest<'_>) -> Result<Action, CollaboratorError> {
        let body = self.build_body(&request);
        debug!(
            run_id = request.run_id,
            messages = body["messages"].as_array().map(|m| m.len()).unwrap_or(0),
            remaining = request.remaining_steps,
            "Requesting next action"
        );

        let mut http = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.header("Authorization", format!("Bearer {}", key));
        }

        let response = http
            .send()
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::Unavailable(format!(
                "LLM API returned {}: {}",
                status, error_text
            )));
        }
        let response_json: Value = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Malformed(e.to_string()))?;

        if let Some(usage) = response_json.get("usage") {
            debug!(run_id = request.run_id, %usage, "Token usage");
        }

        let content = extract_openai_assistant_content(&response_json);
        let calls = extract_openai_tool_calls(&response_json);
        if !calls.is_empty() && request.remaining_steps > 0 {
            info!(run_id = request.run_id, calls = calls.len(), "LLM requested tool calls");
            return Ok(Action::ToolCalls {
                reasoning: Some(content).filter(|c| !c.trim().is_empty()),
                calls,
            });
        }
        if content.trim().is_empty() {
            return Err(CollaboratorError::Malformed(
                "response has neither content nor tool calls".to_string(),
            ));
        }
        Ok(Action::FinalAnswer(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogEntry;
    use crate::tools::ToolSpec;

    fn collaborator() -> OpenAiCollaborator {
        OpenAiCollaborator::new(LlmConfig {
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn strips_provider_prefix_and_picks_provider_url() {
        let c = collaborator();
        assert_eq!(c.model, "deepseek-chat");
        assert_eq!(c.url, "https://api.deepseek.com/v1/chat/completions");
    }

    #[test]
    fn concluding_request_offers_no_tools() {
        let c = collaborator();
        let tools = vec![ToolSpec {
            name: "kubectl_get".to_string(),
            description: "list".to_string(),
            input_schema: json!({"type": "object"}),
            source: "builtin".to_string(),
        }];
        let runbooks = vec![CatalogEntry {
            link: "oom.md".to_string(),
            title: "OOMKilled".to_string(),
            description: "memory".to_string(),
            tags: Default::default(),
        }];
        let mut request = DecisionRequest {
            run_id: "r",
            question: "why?",
            transcript: &[],
            tools: &tools,
            runbooks: &runbooks,
            remaining_steps: 3,
        };
        let body = c.build_body(&request);
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert!(body["messages"][0]["content"]
            .as_str()
            .unwrap()
            .contains("OOMKilled [oom.md]"));

        request.remaining_steps = 0;
        let body = c.build_body(&request);
        assert!(body.get("tools").is_none());
        assert_eq!(body["messages"].as_array().unwrap().last().unwrap()["content"], CONCLUDE_PROMPT);
    }
}
