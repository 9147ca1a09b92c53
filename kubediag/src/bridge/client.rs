//! Bridge client
//!
//! One [`BridgeClient`] owns the connection to one remote tool server. The
//! connection is opened lazily, shared by every concurrent call routed to
//! that server, and demultiplexed by correlation id. A dead connection is
//! never reused: the next call makes exactly one reconnection attempt.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, JsonRpcRequest, JsonRpcResponse, RemoteToolInfo};
use super::transport::{BoxedReader, BoxedWriter, Connector};
use crate::error::ToolError;

type Waiter = oneshot::Sender<Result<Value, ToolError>>;

/// Observable state of a bridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Connected,
    /// Never connected, or the link dropped since the last successful connect
    Disconnected,
    /// The last connection attempt failed
    Errored,
}

/// Correlation id → waiter, plus whether the link can still accept calls.
///
/// `alive` and the waiters share one lock so that a call can never be
/// registered after the link has been drained.
struct PendingTable {
    inner: Mutex<PendingInner>,
}

struct PendingInner {
    alive: bool,
    waiters: HashMap<u64, Waiter>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                alive: true,
                waiters: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingInner> {
        // A poisoned table only means a panicking holder; the map itself is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, id: u64) -> Option<oneshot::Receiver<Result<Value, ToolError>>> {
        let mut inner = self.lock();
        if !inner.alive {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Some(rx)
    }

    fn complete(&self, id: u64, outcome: Result<Value, ToolError>) -> bool {
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    fn is_alive(&self) -> bool {
        self.lock().alive
    }

    fn in_flight(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Mark the link dead and fail every in-flight call.
    fn close(&self, reason: &str) {
        let drained: Vec<Waiter> = {
            let mut inner = self.lock();
            inner.alive = false;
            inner.waiters.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(Err(ToolError::RemoteFault(reason.to_string())));
        }
    }
}

/// Removes a pending entry when the awaiting call finishes, times out or is dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// A live connection: background reader/writer tasks plus the pending table.
struct LiveLink {
    outbound: mpsc::Sender<String>,
    pending: Arc<PendingTable>,
    tasks: Vec<JoinHandle<()>>,
    _child: Option<Child>,
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pending.close("bridge connection closed");
    }
}

impl LiveLink {
    fn spawn(
        bridge: &str,
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> Self {
        let pending = Arc::new(PendingTable::new());
        let (outbound, rx) = mpsc::channel::<String>(64);

        let reader_task = tokio::spawn(read_loop(bridge.to_string(), reader, Arc::clone(&pending)));
        let writer_task = tokio::spawn(write_loop(
            bridge.to_string(),
            writer,
            rx,
            Arc::clone(&pending),
        ));

        Self {
            outbound,
            pending,
            tasks: vec![reader_task, writer_task],
            _child: child,
        }
    }
}

async fn read_loop(bridge: String, mut reader: BoxedReader, pending: Arc<PendingTable>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                info!(bridge = %bridge, "Bridge stream closed by remote");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(bridge = %bridge, "Ignoring non-response frame: {}", e);
                        continue;
                    }
                };
                let Some(id) = response.correlation_id() else {
                    debug!(bridge = %bridge, "Ignoring frame without correlation id");
                    continue;
                };
                let outcome = match response.error {
                    Some(err) => Err(ToolError::RemoteFault(format!(
                        "{} (code {})",
                        err.message, err.code
                    ))),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                if !pending.complete(id, outcome) {
                    debug!(bridge = %bridge, id, "Discarding late or unknown response");
                }
            }
            Err(e) => {
                warn!(bridge = %bridge, "Error reading bridge stream: {}", e);
                break;
            }
        }
    }
    pending.close(&format!("connection to bridge '{}' lost", bridge));
}

async fn write_loop(
    bridge: String,
    mut writer: BoxedWriter,
    mut rx: mpsc::Receiver<String>,
    pending: Arc<PendingTable>,
) {
    while let Some(frame) = rx.recv().await {
        let written = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(bridge = %bridge, "Failed to write to bridge: {}", e);
            pending.close(&format!("write to bridge '{}' failed: {}", bridge, e));
            break;
        }
    }
}

struct Status {
    link: Option<Arc<PendingTable>>,
    errored: bool,
}

/// Client side of one bridged tool server.
pub struct BridgeClient {
    name: String,
    connector: Arc<dyn Connector>,
    handshake_timeout: Duration,
    link: tokio::sync::Mutex<Option<Arc<LiveLink>>>,
    status: Mutex<Status>,
    tools: Mutex<Vec<RemoteToolInfo>>,
    next_id: AtomicU64,
    connect_attempts: AtomicU64,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("name", &self.name)
            .field("endpoint", &self.connector.endpoint())
            .field("liveness", &self.liveness())
            .finish()
    }
}

impl BridgeClient {
    pub fn new(name: &str, connector: Arc<dyn Connector>, handshake_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            connector,
            handshake_timeout,
            link: tokio::sync::Mutex::new(None),
            status: Mutex::new(Status {
                link: None,
                errored: false,
            }),
            tools: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            connect_attempts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    /// Number of connection attempts made so far (successful or not).
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn liveness(&self) -> Liveness {
        let status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        match &status.link {
            Some(table) if table.is_alive() => Liveness::Connected,
            _ if status.errored => Liveness::Errored,
            _ => Liveness::Disconnected,
        }
    }

    /// Calls awaiting a response on the current connection.
    pub fn in_flight(&self) -> usize {
        let status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        status.link.as_ref().map(|t| t.in_flight()).unwrap_or(0)
    }

    /// Tools advertised by the server, connecting first if needed.
    pub async fn list_tools(&self) -> Result<Vec<RemoteToolInfo>, ToolError> {
        self.ensure_link().await?;
        Ok(self.tools.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    /// Invoke a remote tool and flatten its content into text.
    ///
    /// `timeout` bounds the whole call, including any (re)connection and
    /// handshake it has to wait for.
    pub async fn invoke(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<String, ToolError> {
        let call = async {
            let link = self.ensure_link().await?;
            let result = self
                .request(
                    &link,
                    "tools/call",
                    json!({ "name": tool_name, "arguments": arguments }),
                    tool_name,
                    timeout,
                )
                .await?;
            protocol::call_result_text(&result).map_err(ToolError::RemoteFault)
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(bridge = %self.name, tool = tool_name, "Call deadline passed");
                Err(ToolError::Timeout {
                    tool: tool_name.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Drop the current connection, failing its in-flight calls.
    pub async fn disconnect(&self) {
        let previous = self.link.lock().await.take();
        if previous.is_some() {
            info!(bridge = %self.name, "Bridge disconnected");
        }
        let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
        status.link = None;
    }

    async fn ensure_link(&self) -> Result<Arc<LiveLink>, ToolError> {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if link.pending.is_alive() {
                return Ok(Arc::clone(link));
            }
            warn!(bridge = %self.name, "Bridge connection is dead, reconnecting");
        }
        *slot = None;

        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.connect().await {
            Ok(link) => {
                let link = Arc::new(link);
                *slot = Some(Arc::clone(&link));
                let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
                status.link = Some(Arc::clone(&link.pending));
                status.errored = false;
                Ok(link)
            }
            Err(e) => {
                warn!(bridge = %self.name, attempt, "Bridge connection failed: {}", e);
                let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
                status.link = None;
                status.errored = true;
                Err(match e {
                    ToolError::RemoteFault(msg) => ToolError::RemoteFault(msg),
                    other => ToolError::RemoteFault(format!(
                        "bridge '{}' handshake failed: {}",
                        self.name, other
                    )),
                })
            }
        }
    }

    async fn connect(&self) -> Result<LiveLink, ToolError> {
        let raw = match tokio::time::timeout(self.handshake_timeout, self.connector.connect()).await {
            Ok(connected) => connected.map_err(|e| {
                ToolError::RemoteFault(format!("bridge '{}' unreachable: {}", self.name, e))
            })?,
            Err(_) => {
                return Err(ToolError::RemoteFault(format!(
                    "bridge '{}' did not accept a connection within {}ms",
                    self.name,
                    self.handshake_timeout.as_millis()
                )))
            }
        };
        let link = LiveLink::spawn(&self.name, raw.reader, raw.writer, raw.child);

        self.request(
            &link,
            "initialize",
            protocol::initialize_params("kubediag"),
            "initialize",
            self.handshake_timeout,
        )
        .await?;
        self.notify(&link, "notifications/initialized").await?;

        let listed = self
            .request(&link, "tools/list", json!({}), "tools/list", self.handshake_timeout)
            .await?;
        let tools = protocol::parse_tools_list(&listed).map_err(ToolError::RemoteFault)?;
        info!(
            bridge = %self.name,
            endpoint = %self.connector.endpoint(),
            tools = tools.len(),
            "Bridge connected"
        );
        *self.tools.lock().unwrap_or_else(|p| p.into_inner()) = tools;
        Ok(link)
    }

    async fn notify(&self, link: &LiveLink, method: &str) -> Result<(), ToolError> {
        let frame = serde_json::to_string(&JsonRpcRequest::notification(method))
            .map_err(|e| ToolError::RemoteFault(format!("failed to encode request: {}", e)))?;
        link.outbound
            .send(frame)
            .await
            .map_err(|_| ToolError::RemoteFault(format!("bridge '{}' writer closed", self.name)))
    }

    async fn request(
        &self,
        link: &LiveLink,
        method: &str,
        params: Value,
        label: &str,
        timeout: Duration,
    ) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = link.pending.register(id).ok_or_else(|| {
            ToolError::RemoteFault(format!("connection to bridge '{}' lost", self.name))
        })?;
        let _guard = PendingGuard {
            table: &link.pending,
            id,
        };

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| ToolError::RemoteFault(format!("failed to encode request: {}", e)))?;
        link.outbound
            .send(frame)
            .await
            .map_err(|_| ToolError::RemoteFault(format!("bridge '{}' writer closed", self.name)))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ToolError::RemoteFault(format!(
                "bridge '{}' dropped the response channel",
                self.name
            ))),
            Err(_) => {
                debug!(bridge = %self.name, id, method, "Request timed out, abandoning");
                Err(ToolError::Timeout {
                    tool: label.to_string(),
                    after: timeout,
                })
            }
        }
    }
}
