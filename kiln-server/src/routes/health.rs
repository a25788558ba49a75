//! Liveness and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use utoipa::OpenApi;

use crate::metrics::MetricsSnapshot;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_healthz, get_metrics), components(schemas(MetricsSnapshot)))]
pub struct HealthApi;

/// Register health and metrics routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
}

/// Heartbeat endpoint for load balancers and monitors.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "health",
    responses((status = 200, description = "Server is healthy", body = Value))
)]
pub async fn get_healthz(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_ms": state.started_at.elapsed().as_millis() as u64,
    }))
}

/// Current request counters.
#[utoipa::path(
    get,
    path = "/metrics",
    tag = "health",
    responses((status = 200, description = "Request counters", body = MetricsSnapshot))
)]
pub async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
