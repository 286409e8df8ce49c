//! HTTP surface: health probes, metrics, and sync introspection.

use axum::{Json, extract::State, response::IntoResponse};

use crate::metrics::HealthStatus;
use crate::server::AppState;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();

    let status = if snapshot.errors.websocket == 0 && snapshot.errors.storage == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthStatus {
        status: status.to_string(),
        connections: snapshot.connections.active,
        uptime_secs: snapshot.uptime_secs,
    })
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Connected-client introspection: count plus redacted per-client
/// summaries (id, last activity, capabilities, sync-in-progress).
pub async fn clients_handler(State(state): State<AppState>) -> impl IntoResponse {
    let clients = state.sync.client_summaries().await;
    Json(serde_json::json!({
        "count": clients.len(),
        "clients": clients,
    }))
}
