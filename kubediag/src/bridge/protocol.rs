//! JSON-RPC 2.0 frames exchanged with remote tool servers.
//!
//! Frames are newline-delimited JSON objects. Requests carry a numeric
//! correlation id; notifications carry none and receive no response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(json!(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.to_string(),
            params: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Correlation id as the numeric form the client issues.
    ///
    /// Servers echoing ids back as strings are accepted too.
    pub fn correlation_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A tool advertised by a remote server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub fn initialize_params(client_name: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

pub fn parse_tools_list(result: &Value) -> Result<Vec<RemoteToolInfo>, String> {
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| "tools/list result has no 'tools' field".to_string())?;
    serde_json::from_value(tools).map_err(|e| format!("invalid tools/list result: {}", e))
}

/// Flatten a `tools/call` result into text.
///
/// Text content items are joined with newlines; non-text items are
/// rendered as JSON. `isError: true` turns the text into an `Err`.
pub fn call_result_text(result: &Value) -> Result<String, String> {
    let text = match result.get("content").and_then(|c| c.as_array()) {
        Some(items) => items
            .iter()
            .map(|item| match item.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    };

    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if is_error {
        Err(text)
    } else {
        Ok(text)
    }
}

pub fn call_result(text: &str, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_result_joins_text_and_flags_errors() {
        let ok = json!({ "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}] });
        assert_eq!(call_result_text(&ok), Ok("a\nb".to_string()));

        let failed = call_result("index missing", true);
        assert_eq!(call_result_text(&failed), Err("index missing".to_string()));
    }

    #[test]
    fn correlation_id_accepts_numeric_and_string_ids() {
        let numeric: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        let string: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"8","result":{}}"#).unwrap();
        assert_eq!(numeric.correlation_id(), Some(7));
        assert_eq!(string.correlation_id(), Some(8));
    }

    #[test]
    fn tools_list_defaults_missing_schema() {
        let tools = parse_tools_list(&json!({ "tools": [{ "name": "search" }] })).unwrap();
        assert_eq!(tools[0].name, "search");
        assert_eq!(tools[0].input_schema["type"], "object");
    }

    #[test]
    fn notification_serializes_without_id() {
        let frame = serde_json::to_value(JsonRpcRequest::notification("notifications/initialized")).unwrap();
        assert!(frame.get("id").is_none());
    }
}
