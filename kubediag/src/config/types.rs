use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Hard ceiling on the tool-call budget of one run.
pub const MAX_STEP_CEILING: u32 = 100;

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    /// Remote tool servers keyed by bridge name
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeConfig>,
    #[serde(default)]
    pub toolsets: ToolsetsConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default step budget when a request does not specify one
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    /// Per-call timeout applied to every tool invocation
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// A (tool, arguments) pair issued more often than this ends the run early
    #[serde(default = "default_max_identical_calls")]
    pub max_identical_calls: u32,
    /// Capacity of the per-run event channel
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_timeout_secs: default_tool_timeout(),
            max_identical_calls: default_max_identical_calls(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name, informational only (all providers speak the OpenAI chat API)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model name/identifier
    #[serde(default = "default_model")]
    pub model: String,
    /// API key (falls back to DEEPSEEK_API_KEY, then OPENAI_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Base URL for API (optional, for custom endpoints)
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Overrides the built-in system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
            system_prompt: None,
        }
    }
}

impl LlmConfig {
    /// Configured key, or the first provider key found in the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("DEEPSEEK_API_KEY").ok())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }
}

/// One remote tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Overrides the engine-wide tool timeout for this bridge
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub transport: TransportConfig,
}

/// How to reach a remote tool server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawn a local process and speak over its stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Connect to a server listening on a TCP address
    Tcp { address: String },
}

impl TransportConfig {
    /// Human-readable endpoint used in logs and pool keys
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Stdio { command, args, .. } => {
                if args.is_empty() {
                    format!("stdio:{}", command)
                } else {
                    format!("stdio:{} {}", command, args.join(" "))
                }
            }
            TransportConfig::Tcp { address } => format!("tcp:{}", address),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsetsConfig {
    #[serde(default)]
    pub kubernetes: KubernetesToolsetConfig,
    #[serde(default)]
    pub prometheus: PrometheusToolsetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubernetesToolsetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
    /// kubeconfig context; the current context when unset
    #[serde(default)]
    pub context: Option<String>,
}

impl Default for KubernetesToolsetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            kubectl: default_kubectl(),
            context: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusToolsetConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_prometheus_url")]
    pub url: String,
    #[serde(default = "default_prometheus_timeout")]
    pub timeout_secs: u64,
}

impl Default for PrometheusToolsetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_prometheus_url(),
            timeout_secs: default_prometheus_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Primary runbook directory containing `catalog.json`
    #[serde(default = "default_catalog_dir")]
    pub dir: PathBuf,
    /// Extra directories merged after the primary one
    #[serde(default)]
    pub additional_dirs: Vec<PathBuf>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dir: default_catalog_dir(),
            additional_dirs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_steps() -> u32 {
    50
}

fn default_tool_timeout() -> u64 {
    60
}

fn default_max_identical_calls() -> u32 {
    3
}

fn default_event_buffer() -> usize {
    256
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek/deepseek-chat".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_prometheus_timeout() -> u64 {
    30
}

fn default_catalog_dir() -> PathBuf {
    PathBuf::from("knowledge_base/runbooks")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}
