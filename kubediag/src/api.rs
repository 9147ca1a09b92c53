//! HTTP API
//!
//! `POST /api/v1/query` runs a question to completion and returns the
//! report; `POST /api/v1/query/stream` streams run events as SSE or plain
//! text. Closing a stream does not stop the run: streamed and
//! `POST /api/v1/query/async` runs are archived and their reports can be
//! fetched from `GET /api/v1/runs/:run_id`.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{unfold, Stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{ServerConfig, MAX_STEP_CEILING};
use crate::engine::{Engine, RunCompletion, RunOptions};
use crate::streaming::{RunReport, StreamEvent};

/// Finished or running runs kept for `GET /api/v1/runs/:run_id`
pub const RUN_ARCHIVE_CAPACITY: usize = 256;

/// Response header carrying the id of a streamed run
pub const RUN_ID_HEADER: &str = "x-run-id";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Sse,
    Text,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub max_steps: Option<u32>,
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl QueryRequest {
    fn validate(&self) -> Result<RunOptions, String> {
        if self.question.trim().is_empty() {
            return Err("question must not be empty".to_string());
        }
        if let Some(steps) = self.max_steps {
            if steps == 0 || steps > MAX_STEP_CEILING {
                return Err(format!("max_steps must be between 1 and {}", MAX_STEP_CEILING));
            }
        }
        Ok(RunOptions {
            max_steps: self.max_steps,
            cancel: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunRecord {
    Running { run_id: String },
    Finished { report: RunReport },
    Lost { run_id: String, error: String },
}

/// Bounded record of recent runs; the oldest entry is evicted first.
#[derive(Debug)]
pub struct RunArchive {
    capacity: usize,
    inner: Mutex<ArchiveInner>,
}

#[derive(Debug, Default)]
struct ArchiveInner {
    order: VecDeque<String>,
    records: HashMap<String, RunRecord>,
}

impl RunArchive {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(ArchiveInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArchiveInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn begin(&self, run_id: &str) {
        self.put(
            run_id,
            RunRecord::Running {
                run_id: run_id.to_string(),
            },
        );
    }

    pub fn finish(&self, report: RunReport) {
        let run_id = report.run_id.clone();
        self.put(&run_id, RunRecord::Finished { report });
    }

    pub fn lose(&self, run_id: &str, error: String) {
        self.put(
            run_id,
            RunRecord::Lost {
                run_id: run_id.to_string(),
                error,
            },
        );
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.lock().records.get(run_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, run_id: &str, record: RunRecord) {
        let mut inner = self.lock();
        if inner.records.insert(run_id.to_string(), record).is_none() {
            inner.order.push_back(run_id.to_string());
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.records.remove(&evicted);
            }
        }
    }
}

pub struct AppState {
    pub engine: Arc<Engine>,
    pub runs: RunArchive,
    started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            runs: RunArchive::new(RUN_ARCHIVE_CAPACITY),
            started_at: Instant::now(),
        }
    }

    /// Archive the run's report once it finishes, whoever is watching.
    fn track(self: &Arc<Self>, run_id: &str, completion: RunCompletion) {
        self.runs.begin(run_id);
        let state = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            match completion.wait().await {
                Ok(finished) => state.runs.finish(finished.report),
                Err(e) => {
                    warn!(run_id = %run_id, "Run task ended without a report: {}", e);
                    state.runs.lose(&run_id, e.to_string());
                }
            }
        });
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/api/v1/tools", get(handle_tools))
        .route("/api/v1/runbooks", get(handle_runbooks))
        .route("/api/v1/bridges", get(handle_bridges))
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/query/stream", post(handle_query_stream))
        .route("/api/v1/query/async", post(handle_query_async))
        .route("/api/v1/runs/:run_id", get(handle_run))
        .route("/api/v1/reload", post(handle_reload))
        .with_state(state)
}

pub async fn run_server(engine: Arc<Engine>, config: &ServerConfig) -> anyhow::Result<()> {
    let app = router(Arc::new(AppState::new(engine)));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Kubediag API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Kubediag API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", err);
        return;
    }
    info!("Ctrl+C received, shutting down...");
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

async fn handle_root() -> impl IntoResponse {
    Json(json!({
        "name": "kubediag",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /health",
            "tools": "GET /api/v1/tools",
            "runbooks": "GET /api/v1/runbooks",
            "bridges": "GET /api/v1/bridges",
            "query": "POST /api/v1/query",
            "stream": "POST /api/v1/query/stream",
            "async": "POST /api/v1/query/async",
            "run": "GET /api/v1/runs/{run_id}",
            "reload": "POST /api/v1/reload"
        }
    }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.snapshot();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "generation": snapshot.generation,
        "tools": snapshot.registry.len(),
        "runbooks": snapshot.catalog.len(),
    }))
}

async fn handle_tools(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools = state.engine.list_tools();
    Json(json!({ "count": tools.len(), "tools": tools }))
}

async fn handle_runbooks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let runbooks = state.engine.runbooks();
    Json(json!({ "count": runbooks.len(), "runbooks": runbooks }))
}

async fn handle_bridges(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "bridges": state.engine.bridge_status() }))
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let options = match request.validate() {
        Ok(o) => o,
        Err(e) => return bad_request(e),
    };
    match state.engine.ask(&request.question, options).await {
        Ok(finished) => Json(finished.report).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn handle_query_stream(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let options = match request.validate() {
        Ok(o) => o,
        Err(e) => return bad_request(e),
    };
    let handle = state.engine.start(&request.question, options);
    let run_id = handle.run_id.clone();
    info!(run_id = %run_id, format = ?request.output_format, "Streaming run");
    let (events, completion) = handle.into_parts();
    state.track(&run_id, completion);

    let mut response = match request.output_format {
        OutputFormat::Sse => {
            let stream = event_stream(events, |event| {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Event::default().event(event.name()).data(data)
            });
            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        OutputFormat::Text => {
            let stream = event_stream(events, |event| event.to_text());
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                Body::from_stream(stream),
            )
                .into_response()
        }
    };
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    response
}

async fn handle_query_async(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let options = match request.validate() {
        Ok(o) => o,
        Err(e) => return bad_request(e),
    };
    let handle = state.engine.start(&request.question, options);
    let run_id = handle.run_id.clone();
    info!(run_id = %run_id, "Accepted background run");
    let (_events, completion) = handle.into_parts();
    state.track(&run_id, completion);
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "run_id": run_id,
            "status": "running",
            "result_url": format!("/api/v1/runs/{}", run_id),
        })),
    )
        .into_response()
}

async fn handle_run(State(state): State<Arc<AppState>>, Path(run_id): Path<String>) -> Response {
    match state.runs.get(&run_id) {
        Some(record) => Json(record).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown run: {}", run_id) })),
        )
            .into_response(),
    }
}

async fn handle_reload(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.reload_from_disk().await {
        Ok(generation) => Json(json!({
            "status": "reloaded",
            "generation": generation,
            "tools": state.engine.list_tools().len(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Forward events until the run finishes; lagged events are skipped.
fn event_stream<T, F>(
    rx: broadcast::Receiver<StreamEvent>,
    encode: F,
) -> impl Stream<Item = Result<T, Infallible>>
where
    F: Fn(StreamEvent) -> T + Send + 'static,
    T: Send + 'static,
{
    unfold((rx, false, encode), |(mut rx, done, encode)| async move {
        if done {
            return None;
        }
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let terminal = event.is_terminal();
                    return Some((Ok(encode(event)), (rx, terminal, encode)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Stream subscriber lagging, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}
