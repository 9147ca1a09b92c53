//! Tool descriptors and the uniform invocation handle.
//!
//! Every capability the collaborator can call, whether it runs in-process
//! or on a bridged server, is a [`ToolDescriptor`]. The provider is chosen
//! once at registration; invocation never dispatches on the name again.

pub mod builtin;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::BridgeClient;
use crate::error::ToolError;

pub use registry::ToolRegistry;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>;

/// Async in-process tool implementation
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// Wrap an async closure into a [`ToolHandler`].
pub fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

#[derive(Clone)]
pub enum ToolProvider {
    Local(ToolHandler),
    Bridge {
        client: Arc<BridgeClient>,
        /// Name of the tool on the remote server
        remote_name: String,
        /// Overrides the engine-wide call timeout
        timeout: Option<Duration>,
    },
}

impl std::fmt::Debug for ToolProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolProvider::Local(_) => f.write_str("Local(<handler>)"),
            ToolProvider::Bridge {
                client,
                remote_name,
                ..
            } => write!(f, "Bridge({}:{})", client.name(), remote_name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub provider: ToolProvider,
}

impl ToolDescriptor {
    pub fn local(name: &str, description: &str, input_schema: Value, handler: ToolHandler) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            provider: ToolProvider::Local(handler),
        }
    }

    /// Source label shown in tool listings
    pub fn source(&self) -> String {
        match &self.provider {
            ToolProvider::Local(_) => "builtin".to_string(),
            ToolProvider::Bridge { client, .. } => format!("bridge:{}", client.name()),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            source: self.source(),
        }
    }

    /// Run the tool, bounded by `timeout` (or the bridge's own override).
    pub async fn invoke(&self, arguments: Value, timeout: Duration) -> Result<String, ToolError> {
        match &self.provider {
            ToolProvider::Local(handler) => {
                match tokio::time::timeout(timeout, handler(arguments)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ToolError::Timeout {
                        tool: self.name.clone(),
                        after: timeout,
                    }),
                }
            }
            ToolProvider::Bridge {
                client,
                remote_name,
                timeout: override_timeout,
            } => {
                let timeout = override_timeout.unwrap_or(timeout);
                client
                    .invoke(remote_name, arguments, timeout)
                    .await
                    .map_err(|e| match e {
                        ToolError::Timeout { after, .. } => ToolError::Timeout {
                            tool: self.name.clone(),
                            after,
                        },
                        other => other,
                    })
            }
        }
    }
}

/// Serializable view of a tool, as presented to the collaborator and API clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub source: String,
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing required string '{}'", key)))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_tool_times_out() {
        let slow = ToolDescriptor::local(
            "slow",
            "never answers in time",
            json!({}),
            handler(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            }),
        );
        let err = slow
            .invoke(json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { ref tool, .. } if tool == "slow"));
    }

    #[test]
    fn argument_helpers_reject_blank_strings() {
        let args = json!({ "pod": "api-0", "namespace": "  " });
        assert_eq!(required_str(&args, "pod").unwrap(), "api-0");
        assert!(required_str(&args, "namespace").is_err());
        assert_eq!(optional_str(&args, "namespace"), None);
    }
}
