//! Bridge server: remote-debugging and relay transports behind one HTTP surface.
//!
//! Run with: cargo run -p bridge-server -- [config.toml]
//!
//! Start the design application with `--remote-debugging-port=9222`, and/or
//! open the bridge plugin so it connects to `ws://127.0.0.1:9223/ws`.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{KeepAlive, Sse},
    },
    routing::{get, post},
};
use plugin_bridge_cdp::CdpBrowser;
use plugin_bridge_core::{
    BridgeConfig, BridgeError, DocumentMutation, ErrorKind, LevelFilter, LogBuffer, LogQuery,
    PluginBridge, ScreenshotRequest, VariableUpdate,
};
use plugin_bridge_executor::{AutoBridge, CdpBridge, RelayBridge};
use plugin_bridge_relay::{CommandChannel, websocket::create_relay_router};
use plugin_bridge_session::ConnectionManager;
use serde::Deserialize;
use serde_json::{Value, json};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    manager: Arc<ConnectionManager<CdpBrowser>>,
    bridge: Arc<dyn PluginBridge>,
    buffer: Arc<LogBuffer>,
    channel: Arc<CommandChannel>,
    execute_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref()).context("loading configuration")?;

    let buffer = Arc::new(LogBuffer::new(config.console.buffer_size));
    let browser = Arc::new(
        CdpBrowser::new(&config.debug, &config.timeouts).context("creating debugging client")?,
    );
    let manager = Arc::new(ConnectionManager::new(
        browser,
        Arc::clone(&buffer),
        &config,
    ));
    let channel = Arc::new(
        CommandChannel::new().with_console_capture(Arc::clone(&buffer), config.console.truncation),
    );
    let bridge: Arc<dyn PluginBridge> = Arc::new(AutoBridge::new(
        RelayBridge::new(Arc::clone(&channel), &config),
        Arc::new(CdpBridge::new(Arc::clone(&manager), &config.timeouts)),
    ));

    let reevaluation =
        Arc::clone(&manager).spawn_reevaluation(config.debug.reevaluate_interval());

    let state = AppState {
        manager: Arc::clone(&manager),
        bridge,
        buffer,
        channel: Arc::clone(&channel),
        execute_timeout: config.timeouts.execute(),
    };

    let app = Router::new()
        .route("/status", get(status))
        .route("/monitor/start", post(start_monitoring))
        .route("/monitor/stop", post(stop_monitoring))
        .route("/logs", get(get_logs).delete(clear_logs))
        .route("/logs/watch", get(watch_logs))
        .route("/logs/stream", get(stream_logs))
        .route("/execute", post(execute))
        .route("/variables", get(get_variables).post(update_variable))
        .route("/mutate", post(mutate))
        .route("/screenshot", post(screenshot))
        .route("/navigate", post(navigate))
        .route("/reload", post(reload))
        .route("/reconnect", post(reconnect))
        .with_state(state)
        .merge(create_relay_router(channel))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    let listener = tokio::net::TcpListener::bind(&config.relay.bind)
        .await
        .with_context(|| format!("binding {}", config.relay.bind))?;
    tracing::info!(
        "Bridge listening on http://{} (debugging endpoint {})",
        config.relay.bind,
        config.debug.http_base()
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    reevaluation.abort();
    manager.close().await;
    Ok(())
}

/// Bridge error rendered as a structured payload.
struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Connection | ErrorKind::StaleReference => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Protocol => StatusCode::BAD_GATEWAY,
            ErrorKind::Execution => StatusCode::UNPROCESSABLE_ENTITY,
        };
        tracing::warn!(status = %status, "Request failed: {}", self.0);
        (status, Json(self.0.to_payload())).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "connection": state.manager.status().await,
        "transport": state.bridge.transport(),
        "relay": {
            "connected": state.channel.is_connected(),
            "pendingCommands": state.channel.pending_count(),
            "fileInfo": state.channel.file_info(),
        },
        "buffer": state.buffer.stats(),
    }))
}

async fn start_monitoring(State(state): State<AppState>) -> ApiResult {
    let session = state.manager.start_monitoring().await?;
    Ok(Json(json!({
        "sessionId": session.id(),
        "targetUrl": session.target().url,
        "buffer": state.buffer.stats(),
    })))
}

async fn stop_monitoring(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.manager.stop_monitoring().await;
    Json(json!({ "stopped": stopped }))
}

async fn get_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Json<Value> {
    let logs = state.buffer.query(&query);
    Json(json!({
        "logs": logs,
        "stats": state.buffer.stats(),
    }))
}

async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "cleared": state.buffer.clear() }))
}

#[derive(Debug, Deserialize)]
struct WatchParams {
    #[serde(default = "default_watch_ms")]
    duration_ms: u64,
    count: Option<usize>,
    #[serde(default)]
    level: LevelFilter,
}

const fn default_watch_ms() -> u64 {
    30_000
}

/// Longest accepted console watch.
const MAX_WATCH: Duration = Duration::from_secs(300);

async fn watch_logs(
    State(state): State<AppState>,
    Query(params): Query<WatchParams>,
) -> Json<Value> {
    let duration = Duration::from_millis(params.duration_ms).min(MAX_WATCH);
    let query = LogQuery {
        count: params.count,
        level: params.level,
        since: None,
    };
    let logs = state.buffer.watch(duration, &query).await;
    Json(json!({
        "durationMs": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "logs": logs,
    }))
}

async fn stream_logs(State(state): State<AppState>) -> impl IntoResponse {
    Sse::new(state.buffer.sse_stream()).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    code: String,
    timeout_ms: Option<u64>,
}

async fn execute(State(state): State<AppState>, Json(req): Json<ExecuteRequest>) -> ApiResult {
    let timeout = req
        .timeout_ms
        .map_or(state.execute_timeout, Duration::from_millis);
    let outcome = state.bridge.execute_code(&req.code, timeout).await?;
    Ok(Json(json!(outcome)))
}

async fn get_variables(State(state): State<AppState>) -> ApiResult {
    let outcome = state.bridge.get_variables().await?;
    Ok(Json(json!(outcome)))
}

async fn update_variable(
    State(state): State<AppState>,
    Json(update): Json<VariableUpdate>,
) -> ApiResult {
    let outcome = state.bridge.update_variable(&update).await?;
    Ok(Json(json!(outcome)))
}

async fn mutate(
    State(state): State<AppState>,
    Json(mutation): Json<DocumentMutation>,
) -> ApiResult {
    let outcome = state.bridge.mutate_document(&mutation).await?;
    Ok(Json(json!(outcome)))
}

async fn screenshot(
    State(state): State<AppState>,
    Json(request): Json<ScreenshotRequest>,
) -> ApiResult {
    let shot = state.bridge.capture_screenshot(&request).await?;
    Ok(Json(json!({
        "format": shot.format,
        "width": shot.width,
        "height": shot.height,
        "base64": shot.to_base64(),
    })))
}

#[derive(Debug, Deserialize)]
struct NavigateRequest {
    url: String,
}

async fn navigate(
    State(state): State<AppState>,
    Json(req): Json<NavigateRequest>,
) -> ApiResult {
    let session = state.manager.navigate(&req.url).await?;
    Ok(Json(json!({
        "sessionId": session.id(),
        "url": req.url,
    })))
}

async fn reload(State(state): State<AppState>) -> ApiResult {
    let session = state.manager.reload().await?;
    Ok(Json(json!({ "sessionId": session.id() })))
}

async fn reconnect(State(state): State<AppState>) -> ApiResult {
    let session = state.manager.force_reconnect().await?;
    Ok(Json(json!({
        "sessionId": session.id(),
        "targetUrl": session.target().url,
        "connection": state.manager.status().await,
    })))
}
