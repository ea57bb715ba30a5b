//! Health, liveness, and readiness endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::HealthState;

/// Detailed health as JSON.
///
/// Always `200`; the `state` field carries the server state and `failed`
/// lists tenants whose shell could not be built.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let failed: Vec<_> = state
        .host
        .failed_tenants()
        .into_iter()
        .map(|(tenant, error)| json!({ "tenant": tenant, "error": error }))
        .collect();

    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "initialized": state.host.is_initialized(),
        "shells": state.host.shell_count(),
        "activated": state.host.activated_count(),
        "failed": failed,
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe: `200` while the process answers at all.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: `200` once the server is ready and the tenant registry
/// was loaded, `503` otherwise.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.health_state() == HealthState::Ready && state.host.is_initialized() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
