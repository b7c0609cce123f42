//! Run API server bootstrap and router wiring.

use super::*;

/// Bind and static settings for [`run_gateway_server`].
#[derive(Debug, Clone)]
pub struct RunGatewayServerConfig {
    pub bind: String,
    pub build_dir: PathBuf,
    pub ping_interval: Duration,
}

impl RunGatewayServerConfig {
    pub fn new(bind: impl Into<String>, build_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind: bind.into(),
            build_dir: build_dir.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Serves the run API until ctrl-c.
pub async fn run_gateway_server(
    config: RunGatewayServerConfig,
    service: Arc<RunService>,
) -> Result<()> {
    let bind_addr = resolve_bind_addr(&config.bind)?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind run api server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound run api server address")?;
    tracing::info!(addr = %local_addr, "run api server listening");

    let state = RunGatewayState::new(service, local_addr.port(), config.build_dir)
        .with_ping_interval(config.ping_interval);
    let app = build_run_api_router(Arc::new(state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("run api server exited unexpectedly")?;
    Ok(())
}

pub fn build_run_api_router(state: Arc<RunGatewayState>) -> Router {
    Router::new()
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(API_HEALTH_ENDPOINT, get(handle_health))
        .route(WORKFLOWS_ENDPOINT, get(handle_workflows))
        .route(RUNS_ENDPOINT, get(handle_list_runs).post(handle_create_run))
        .route(RUNS_STREAM_ENDPOINT, get(handle_runs_stream))
        .route(RUN_DETAIL_ENDPOINT, get(handle_get_run))
        .route(RUN_STREAM_ENDPOINT, get(handle_run_stream))
        .route(RUN_STOP_ENDPOINT, post(handle_stop_run))
        .route(BRIDGE_PAGE_ENDPOINT, get(handle_bridge_page))
        .fallback(handle_not_found)
        .layer(axum::middleware::from_fn(log_web_request))
        .with_state(state)
}
