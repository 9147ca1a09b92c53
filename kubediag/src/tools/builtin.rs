//! Built-in toolsets
//!
//! Read-only cluster queries through `kubectl`, PromQL queries against the
//! Prometheus HTTP API, and the runbook fetch tool backed by the catalog.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{handler, optional_str, required_str, ToolDescriptor};
use crate::catalog::CatalogIndex;
use crate::config::{KubernetesToolsetConfig, PrometheusToolsetConfig};
use crate::error::ToolError;

/// Tool output beyond this many characters is cut off
pub const MAX_OUTPUT_CHARS: usize = 20_000;

/// Resource kinds, names, namespaces, label selectors and durations.
static KUBE_ARG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:=,!-]*$").expect("valid kubectl arg regex"));

fn kube_arg<'a>(args: &'a Value, key: &str, required: bool) -> Result<Option<&'a str>, ToolError> {
    let value = if required {
        Some(required_str(args, key)?)
    } else {
        optional_str(args, key)
    };
    match value {
        Some(v) if !KUBE_ARG.is_match(v) => Err(ToolError::InvalidArguments(format!(
            "'{}' has unsupported characters: {}",
            key, v
        ))),
        other => Ok(other),
    }
}

pub fn truncate_output(mut text: String) -> String {
    if text.chars().count() > MAX_OUTPUT_CHARS {
        let cut: String = text.chars().take(MAX_OUTPUT_CHARS).collect();
        text = format!("{}\n... [output truncated at {} characters]", cut, MAX_OUTPUT_CHARS);
    }
    text
}

#[derive(Debug, Clone)]
struct Kubectl {
    binary: String,
    context: Option<String>,
}

impl Kubectl {
    async fn run(&self, mut argv: Vec<String>) -> Result<String, ToolError> {
        if let Some(context) = &self.context {
            argv.push(format!("--context={}", context));
        }
        debug!(command = %self.binary, args = ?argv, "Running kubectl");
        let output = Command::new(&self.binary)
            .args(&argv)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to run {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::ExecutionFailed(format!(
                "kubectl exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.trim().is_empty() {
            return Ok("(no resources found)".to_string());
        }
        Ok(truncate_output(stdout))
    }
}

fn namespace_args(args: &Value, out: &mut Vec<String>) -> Result<(), ToolError> {
    if args.get("all_namespaces").and_then(|v| v.as_bool()).unwrap_or(false) {
        out.push("--all-namespaces".to_string());
    } else if let Some(ns) = kube_arg(args, "namespace", false)? {
        out.push(format!("--namespace={}", ns));
    }
    Ok(())
}

pub fn kubernetes_tools(config: &KubernetesToolsetConfig) -> Vec<ToolDescriptor> {
    let kubectl = Arc::new(Kubectl {
        binary: config.kubectl.clone(),
        context: config.context.clone(),
    });

    let get = {
        let kubectl = Arc::clone(&kubectl);
        ToolDescriptor::local(
            "kubectl_get",
            "List Kubernetes resources (pods, deployments, services, nodes, ...). Read-only.",
            json!({
                "type": "object",
                "properties": {
                    "resource": {"type": "string", "description": "Resource kind, e.g. pods or deployments"},
                    "name": {"type": "string"},
                    "namespace": {"type": "string"},
                    "all_namespaces": {"type": "boolean"},
                    "selector": {"type": "string", "description": "Label selector, e.g. app=api"},
                    "output": {"type": "string", "enum": ["wide", "yaml", "json"]}
                },
                "required": ["resource"]
            }),
            handler(move |args| {
                let kubectl = Arc::clone(&kubectl);
                async move {
                    let mut argv = vec!["get".to_string(), kube_arg(&args, "resource", true)?.unwrap_or_default().to_string()];
                    if let Some(name) = kube_arg(&args, "name", false)? {
                        argv.push(name.to_string());
                    }
                    namespace_args(&args, &mut argv)?;
                    if let Some(selector) = kube_arg(&args, "selector", false)? {
                        argv.push(format!("--selector={}", selector));
                    }
                    let output = match optional_str(&args, "output") {
                        None | Some("wide") => "wide",
                        Some("yaml") => "yaml",
                        Some("json") => "json",
                        Some(other) => {
                            return Err(ToolError::InvalidArguments(format!(
                                "unsupported output format: {}",
                                other
                            )))
                        }
                    };
                    argv.push(format!("--output={}", output));
                    kubectl.run(argv).await
                }
            }),
        )
    };

    let describe = {
        let kubectl = Arc::clone(&kubectl);
        ToolDescriptor::local(
            "kubectl_describe",
            "Describe a Kubernetes resource, including its recent events. Read-only.",
            json!({
                "type": "object",
                "properties": {
                    "resource": {"type": "string"},
                    "name": {"type": "string"},
                    "namespace": {"type": "string"}
                },
                "required": ["resource", "name"]
            }),
            handler(move |args| {
                let kubectl = Arc::clone(&kubectl);
                async move {
                    let mut argv = vec!["describe".to_string()];
                    for key in ["resource", "name"] {
                        argv.push(kube_arg(&args, key, true)?.unwrap_or_default().to_string());
                    }
                    namespace_args(&args, &mut argv)?;
                    kubectl.run(argv).await
                }
            }),
        )
    };

    let logs = {
        let kubectl = Arc::clone(&kubectl);
        ToolDescriptor::local(
            "kubectl_logs",
            "Fetch container logs of a pod. Use previous=true for the last crashed container.",
            json!({
                "type": "object",
                "properties": {
                    "pod": {"type": "string"},
                    "namespace": {"type": "string"},
                    "container": {"type": "string"},
                    "previous": {"type": "boolean"},
                    "tail_lines": {"type": "integer", "minimum": 1, "maximum": 5000},
                    "since": {"type": "string", "description": "Relative duration such as 15m or 1h"}
                },
                "required": ["pod"]
            }),
            handler(move |args| {
                let kubectl = Arc::clone(&kubectl);
                async move {
                    let mut argv = vec![
                        "logs".to_string(),
                        kube_arg(&args, "pod", true)?.unwrap_or_default().to_string(),
                    ];
                    namespace_args(&args, &mut argv)?;
                    if let Some(container) = kube_arg(&args, "container", false)? {
                        argv.push(format!("--container={}", container));
                    }
                    if args.get("previous").and_then(|v| v.as_bool()).unwrap_or(false) {
                        argv.push("--previous".to_string());
                    }
                    let tail = args
                        .get("tail_lines")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(200)
                        .clamp(1, 5000);
                    argv.push(format!("--tail={}", tail));
                    if let Some(since) = kube_arg(&args, "since", false)? {
                        argv.push(format!("--since={}", since));
                    }
                    kubectl.run(argv).await
                }
            }),
        )
    };

    let events = {
        let kubectl = Arc::clone(&kubectl);
        ToolDescriptor::local(
            "kubectl_events",
            "List cluster events sorted by time, optionally for one object.",
            json!({
                "type": "object",
                "properties": {
                    "namespace": {"type": "string"},
                    "all_namespaces": {"type": "boolean"},
                    "object_name": {"type": "string", "description": "Only events whose involved object has this name"}
                }
            }),
            handler(move |args| {
                let kubectl = Arc::clone(&kubectl);
                async move {
                    let mut argv = vec!["get".to_string(), "events".to_string()];
                    namespace_args(&args, &mut argv)?;
                    if let Some(name) = kube_arg(&args, "object_name", false)? {
                        argv.push(format!("--field-selector=involvedObject.name={}", name));
                    }
                    argv.push("--sort-by=.lastTimestamp".to_string());
                    kubectl.run(argv).await
                }
            }),
        )
    };

    vec![get, describe, logs, events]
}

#[derive(Debug, Clone)]
struct Prometheus {
    client: reqwest::Client,
    base: url::Url,
}

impl Prometheus {
    async fn query(&self, endpoint: &str, params: Vec<(&str, String)>) -> Result<String, ToolError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid Prometheus url: {}", e)))?;
        let response = self
            .client
            .get(url)
            .query(&params)
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Prometheus request failed: {}", e)))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid Prometheus response: {}", e)))?;
        if !status.is_success() || body.get("status").and_then(|s| s.as_str()) != Some("success") {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown error");
            return Err(ToolError::ExecutionFailed(format!(
                "Prometheus returned {}: {}",
                status, message
            )));
        }
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let rendered = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
        Ok(truncate_output(rendered))
    }
}

pub fn prometheus_tools(config: &PrometheusToolsetConfig) -> Result<Vec<ToolDescriptor>, ToolError> {
    let mut base = config.url.clone();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = url::Url::parse(&base)
        .map_err(|e| ToolError::InvalidArguments(format!("invalid Prometheus url '{}': {}", config.url, e)))?;
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to build HTTP client: {}", e)))?;
    let prometheus = Arc::new(Prometheus { client, base });

    let instant = {
        let prometheus = Arc::clone(&prometheus);
        ToolDescriptor::local(
            "prometheus_query",
            "Evaluate a PromQL expression at a single point in time.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "PromQL expression"},
                    "time": {"type": "string", "description": "RFC3339 or unix timestamp; defaults to now"}
                },
                "required": ["query"]
            }),
            handler(move |args| {
                let prometheus = Arc::clone(&prometheus);
                async move {
                    let mut params = vec![("query", required_str(&args, "query")?.to_string())];
                    if let Some(time) = optional_str(&args, "time") {
                        params.push(("time", time.to_string()));
                    }
                    prometheus.query("api/v1/query", params).await
                }
            }),
        )
    };

    let range = {
        let prometheus = Arc::clone(&prometheus);
        ToolDescriptor::local(
            "prometheus_range_query",
            "Evaluate a PromQL expression over a time range.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "start": {"type": "string"},
                    "end": {"type": "string"},
                    "step": {"type": "string", "description": "Resolution, e.g. 30s or 5m"}
                },
                "required": ["query", "start", "end"]
            }),
            handler(move |args| {
                let prometheus = Arc::clone(&prometheus);
                async move {
                    let params = vec![
                        ("query", required_str(&args, "query")?.to_string()),
                        ("start", required_str(&args, "start")?.to_string()),
                        ("end", required_str(&args, "end")?.to_string()),
                        ("step", optional_str(&args, "step").unwrap_or("60s").to_string()),
                    ];
                    prometheus.query("api/v1/query_range", params).await
                }
            }),
        )
    };

    Ok(vec![instant, range])
}

/// `fetch_runbook`, bound to one catalog snapshot.
pub fn runbook_tool(catalog: Arc<CatalogIndex>) -> ToolDescriptor {
    ToolDescriptor::local(
        "fetch_runbook",
        "Read the full text of a runbook from the catalog by its link.",
        json!({
            "type": "object",
            "properties": {
                "link": {"type": "string", "description": "Runbook link as listed in the catalog"}
            },
            "required": ["link"]
        }),
        handler(move |args| {
            let catalog = Arc::clone(&catalog);
            async move {
                let link = required_str(&args, "link")?;
                catalog.fetch(link).await
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;

    #[test]
    fn kubectl_args_reject_shell_metacharacters() {
        let args = json!({ "resource": "pods; rm -rf /", "namespace": "default" });
        assert!(matches!(
            kube_arg(&args, "resource", true),
            Err(ToolError::InvalidArguments(_))
        ));
        assert_eq!(kube_arg(&args, "namespace", false).unwrap(), Some("default"));
        let selector = json!({ "selector": "app=api,tier!=cache" });
        assert!(kube_arg(&selector, "selector", false).is_ok());
    }

    #[test]
    fn long_output_is_truncated() {
        let text = truncate_output("x".repeat(MAX_OUTPUT_CHARS + 10));
        assert!(text.ends_with("[output truncated at 20000 characters]"));
    }

    #[tokio::test]
    async fn runbook_tool_requires_link_and_reports_missing_documents() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(
            CatalogIndex::load(&CatalogConfig {
                dir: dir.path().to_path_buf(),
                additional_dirs: vec![],
            })
            .unwrap(),
        );
        let tool = runbook_tool(catalog);
        let timeout = Duration::from_secs(1);
        assert!(matches!(
            tool.invoke(json!({}), timeout).await,
            Err(ToolError::InvalidArguments(_))
        ));
        assert_eq!(
            tool.invoke(json!({"link": "nope.md"}), timeout).await,
            Err(ToolError::DocumentNotFound("nope.md".to_string()))
        );
    }

    #[test]
    fn prometheus_url_must_parse() {
        let config = PrometheusToolsetConfig {
            enabled: true,
            url: "not a url".to_string(),
            timeout_secs: 5,
        };
        assert!(prometheus_tools(&config).is_err());
        let ok = PrometheusToolsetConfig {
            url: "http://prometheus:9090/prom".to_string(),
            ..config
        };
        let names: Vec<String> = prometheus_tools(&ok)
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["prometheus_query", "prometheus_range_query"]);
    }
}
