use crate::dispatch::DispatchStats;
use crate::protocol::HealthReport;
use crate::AppState;
use axum::{extract::State, Json};

/// Hub liveness and load summary
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Hub is up", body = HealthReport)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.hub.health_report())
}

/// Dispatcher queue depth and lifetime counters
#[utoipa::path(
    get,
    path = "/api/stats",
    responses(
        (status = 200, description = "Dispatcher statistics", body = DispatchStats)
    ),
    tag = "tasks"
)]
pub async fn stats(State(state): State<AppState>) -> Json<DispatchStats> {
    Json(state.hub.dispatcher().stats())
}
