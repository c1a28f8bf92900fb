use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use llmlink_broker::ConnectionBroker;
use llmlink_ipc::IpcListener;
use llmlink_protocol::PROTOCOL_VERSION;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::ws;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub broker: ConnectionBroker,
    pub listener: IpcListener,
    /// Period of `metrics_update` pushes on `/ws`.
    pub metrics_interval: Duration,
    pub shutdown: CancellationToken,
}

type ApiResult = std::result::Result<Json<Value>, (StatusCode, String)>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/connections", get(connections))
        .route("/api/metrics", get(metrics))
        .route("/api/metrics/reset", post(reset_metrics))
        .route("/api/version", get(version))
        .route("/api/tunnel/{action}", post(tunnel))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

/// CORS for the status API from `api.cors_origins`. `*` opens it to every
/// origin and an empty list keeps it same-origin.
pub fn build_cors(origins: &[String]) -> Result<CorsLayer> {
    let allow = match allowed_origins(origins)? {
        None => AllowOrigin::any(),
        Some(list) => AllowOrigin::list(list),
    };
    Ok(CorsLayer::new()
        .allow_origin(allow)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(600)))
}

/// `None` means any origin. Entries are trimmed and lose a trailing slash,
/// since browsers send `Origin` without one.
fn allowed_origins(origins: &[String]) -> Result<Option<Vec<HeaderValue>>> {
    if origins.iter().any(|o| o.trim() == "*") {
        return Ok(None);
    }
    origins
        .iter()
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(|o| {
            HeaderValue::from_str(o).with_context(|| format!("invalid CORS origin in config: {o}"))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// GET /api/health - liveness plus the headline quality.
async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let status = state.broker.status();
    let healthy = status.running && status.preferred.is_some();
    Json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "quality": status.status,
        "running": status.running,
        "preferred": status.preferred,
        "peers": state.listener.peer_count(),
        "timestamp": Utc::now(),
    }))
}

/// GET /api/status - full broker status.
async fn status(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(&state.broker.status())
}

/// GET /api/connections - per-endpoint records only.
async fn connections(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(&state.broker.status().endpoints)
}

/// GET /api/metrics
async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult {
    to_json(&state.broker.metrics_snapshot())
}

/// POST /api/metrics/reset
async fn reset_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.broker.reset_metrics();
    Json(json!({ "success": true }))
}

/// GET /api/version
async fn version() -> Json<Value> {
    Json(json!({
        "name": "llmlinkd",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
    }))
}

/// POST /api/tunnel/{start|stop|restart} - broker lifecycle.
async fn tunnel(State(state): State<Arc<AppState>>, Path(action): Path<String>) -> ApiResult {
    let broker = &state.broker;
    let result = match action.as_str() {
        "start" => broker.start(),
        "stop" => {
            broker.stop();
            Ok(())
        }
        "restart" => broker.restart(),
        other => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("unknown tunnel action: {other}"),
            ));
        }
    };
    result.map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::info!(action = %action, running = broker.is_running(), "tunnel action applied");
    Ok(Json(json!({
        "success": true,
        "action": action,
        "running": broker.is_running(),
    })))
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
