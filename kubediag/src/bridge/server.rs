//! Bridge server
//!
//! Serves registered tools over newline-delimited JSON-RPC on any async
//! byte stream. Each request is handled on its own task, so responses may
//! be written out of order; clients correlate them by id.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::{self, JsonRpcRequest, JsonRpcResponse, RemoteToolInfo};
use crate::tools::ToolHandler;

pub struct BridgeServer {
    name: String,
    version: String,
    tools: HashMap<String, (RemoteToolInfo, ToolHandler)>,
    order: Vec<String>,
}

impl BridgeServer {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Register a tool with its handler. Re-registering a name replaces it.
    pub fn register_tool(
        &mut self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: ToolHandler,
    ) {
        let info = RemoteToolInfo {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema,
        };
        if self.tools.insert(name.to_string(), (info, handler)).is_none() {
            self.order.push(name.to_string());
        }
    }

    /// Serve one connection until the peer closes it.
    pub async fn serve<R, W>(self: Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut lines = BufReader::new(reader).lines();
        let (tx, mut rx) = mpsc::channel::<JsonRpcResponse>(64);
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                        Ok(request) if request.id.is_none() => {
                            debug!(method = %request.method, "Notification received");
                        }
                        Ok(request) => {
                            let server = Arc::clone(&self);
                            let tx = tx.clone();
                            handlers.spawn(async move {
                                let response = server.handle_request(request).await;
                                let _ = tx.send(response).await;
                            });
                        }
                        Err(e) => {
                            let response = JsonRpcResponse::failure(
                                None,
                                protocol::PARSE_ERROR,
                                format!("Parse error: {}", e),
                            );
                            write_frame(&mut writer, &response).await?;
                        }
                    }
                }
                Some(response) = rx.recv() => {
                    write_frame(&mut writer, &response).await?;
                }
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }
        Ok(())
    }

    pub async fn serve_stdio(self: Arc<Self>) -> std::io::Result<()> {
        info!(server = %self.name, tools = self.tool_count(), "Serving tools over stdio");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(
            server = %self.name,
            address = %listener.local_addr()?,
            tools = self.tool_count(),
            "Serving tools over tcp"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let (read_half, write_half) = stream.into_split();
                if let Err(e) = server.serve(read_half, write_half).await {
                    warn!(%peer, "Bridge session ended with error: {}", e);
                }
            });
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                request.id,
                json!({
                    "protocolVersion": protocol::PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": self.name, "version": self.version }
                }),
            ),
            "tools/list" => {
                let tools: Vec<&RemoteToolInfo> = self
                    .order
                    .iter()
                    .filter_map(|name| self.tools.get(name).map(|(info, _)| info))
                    .collect();
                JsonRpcResponse::success(request.id, json!({ "tools": tools }))
            }
            "tools/call" => self.handle_tools_call(request.id, &request.params).await,
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            other => JsonRpcResponse::failure(
                request.id,
                protocol::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        }
    }

    async fn handle_tools_call(&self, id: Option<Value>, params: &Value) -> JsonRpcResponse {
        let Some(tool_name) = params.get("name").and_then(|v| v.as_str()) else {
            return JsonRpcResponse::failure(id, protocol::INVALID_PARAMS, "Missing tool name");
        };
        let Some((_, handler)) = self.tools.get(tool_name) else {
            return JsonRpcResponse::failure(
                id,
                protocol::INVALID_PARAMS,
                format!("Unknown tool: {}", tool_name),
            );
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        // Tool failures are results, not protocol errors
        match handler(arguments).await {
            Ok(text) => JsonRpcResponse::success(id, protocol::call_result(&text, false)),
            Err(e) => JsonRpcResponse::success(id, protocol::call_result(&e.to_string(), true)),
        }
    }
}

async fn write_frame<W>(writer: &mut W, response: &JsonRpcResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(encoded.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
