use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use exrun_browser::extension_manifest_path;
use exrun_core::now_rfc3339;
use exrun_runs::{CreateRunRequest, RunService, RunStatusFilter};

mod bridge_page;
mod server_bootstrap;
mod sse_runtime;
mod types;

use bridge_page::render_bridge_page;
pub use server_bootstrap::{build_run_api_router, run_gateway_server, RunGatewayServerConfig};
use sse_runtime::{run_list_stream_loop, run_log_stream_loop};
use types::{ok_envelope, RunApiError};

const HEALTH_ENDPOINT: &str = "/health";
const API_HEALTH_ENDPOINT: &str = "/api/health";
const WORKFLOWS_ENDPOINT: &str = "/api/workflows";
const RUNS_ENDPOINT: &str = "/api/runs";
const RUNS_STREAM_ENDPOINT: &str = "/api/runs/stream";
const RUN_DETAIL_ENDPOINT: &str = "/api/runs/{run_id}";
const RUN_STREAM_ENDPOINT: &str = "/api/runs/{run_id}/stream";
const RUN_STOP_ENDPOINT: &str = "/api/runs/{run_id}/stop";
pub const BRIDGE_PAGE_ENDPOINT: &str = "/bridge.html";

/// Interval between keep-alive `ping` entries on SSE streams.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct RunGatewayState {
    pub service: Arc<RunService>,
    pub port: u16,
    pub build_dir: PathBuf,
    pub ping_interval: Duration,
}

impl RunGatewayState {
    pub fn new(service: Arc<RunService>, port: u16, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            service,
            port,
            build_dir: build_dir.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunListQuery {
    #[serde(default)]
    status: Option<String>,
}

fn parse_status_filter(query: &RunListQuery) -> Result<Option<RunStatusFilter>, RunApiError> {
    match query.status.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(raw) => RunStatusFilter::parse(raw).map(Some).ok_or_else(|| {
            RunApiError::bad_request(
                "invalid_input",
                format!("unsupported status filter '{raw}'"),
            )
        }),
    }
}

/// Emits `[web] METHOD path -> status Nms` once the response is ready.
async fn log_web_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let started = tokio::time::Instant::now();
    let response = next.run(request).await;
    tracing::info!(
        "[web] {method} {path} -> {} {}ms",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

async fn handle_health(State(state): State<Arc<RunGatewayState>>) -> Response {
    let build_ready = extension_manifest_path(&state.build_dir).is_file();
    ok_envelope(json!({
        "ok": true,
        "port": state.port,
        "buildDir": state.build_dir.display().to_string(),
        "workflowsDir": state.service.workflows().dir().display().to_string(),
        "buildReady": build_ready,
        "ts": now_rfc3339(),
    }))
}

async fn handle_workflows(State(state): State<Arc<RunGatewayState>>) -> Response {
    ok_envelope(json!({ "items": state.service.list_workflows() }))
}

async fn handle_create_run(State(state): State<Arc<RunGatewayState>>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        CreateRunRequest::default()
    } else {
        match serde_json::from_slice::<CreateRunRequest>(&body) {
            Ok(request) => request,
            Err(error) => {
                return RunApiError::bad_request(
                    "invalid_input",
                    format!("failed to parse request body: {error}"),
                )
                .into_response();
            }
        }
    };
    match state.service.create(request).await {
        Ok(run_id) => ok_envelope(json!({ "runId": run_id })),
        Err(error) => RunApiError::from(error).into_response(),
    }
}

async fn handle_list_runs(
    State(state): State<Arc<RunGatewayState>>,
    Query(query): Query<RunListQuery>,
) -> Response {
    match parse_status_filter(&query) {
        Ok(filter) => ok_envelope(json!({ "items": state.service.list(filter) })),
        Err(error) => error.into_response(),
    }
}

async fn handle_get_run(
    State(state): State<Arc<RunGatewayState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.service.get(&run_id) {
        Ok(snapshot) => ok_envelope(json!(snapshot)),
        Err(error) => RunApiError::from(error).into_response(),
    }
}

async fn handle_stop_run(
    State(state): State<Arc<RunGatewayState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.service.stop(&run_id).await {
        Ok(()) => ok_envelope(json!({ "stopped": true })),
        Err(error) => RunApiError::from(error).into_response(),
    }
}

async fn handle_run_stream(
    State(state): State<Arc<RunGatewayState>>,
    Path(run_id): Path<String>,
) -> Response {
    let subscription = match state.service.subscribe(&run_id) {
        Ok(subscription) => subscription,
        Err(error) => return RunApiError::from(error).into_response(),
    };
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(run_log_stream_loop(subscription, tx, state.ping_interval));
    sse_response(rx)
}

async fn handle_runs_stream(
    State(state): State<Arc<RunGatewayState>>,
    Query(query): Query<RunListQuery>,
) -> Response {
    let filter = match parse_status_filter(&query) {
        Ok(filter) => filter,
        Err(error) => return error.into_response(),
    };
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(run_list_stream_loop(
        Arc::clone(&state.service),
        filter,
        tx,
        state.ping_interval,
    ));
    sse_response(rx)
}

fn sse_response(rx: mpsc::UnboundedReceiver<Event>) -> Response {
    let stream = UnboundedReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_bridge_page(State(state): State<Arc<RunGatewayState>>) -> Html<String> {
    Html(render_bridge_page(state.port))
}

async fn handle_not_found() -> Response {
    RunApiError::not_found("not_found", "route not found").into_response()
}

fn resolve_bind_addr(bind: &str) -> Result<SocketAddr> {
    bind.parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address '{bind}'"))
}
