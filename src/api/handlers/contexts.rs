use crate::dispatch::TaskSnapshot;
use crate::memory::{ContextFilter, ContextTrace, SessionContext};
use crate::types::{AppError, Result};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};

/// List contexts, oldest first
#[utoipa::path(
    get,
    path = "/api/contexts",
    params(ContextFilter),
    responses(
        (status = 200, description = "Matching contexts", body = Vec<SessionContext>),
        (status = 400, description = "Invalid filter")
    ),
    tag = "contexts"
)]
pub async fn list_contexts(
    State(state): State<AppState>,
    Query(filter): Query<ContextFilter>,
) -> Json<Vec<SessionContext>> {
    Json(state.hub.contexts().list_contexts(&filter))
}

#[utoipa::path(
    get,
    path = "/api/contexts/{id}",
    params(("id" = String, Path, description = "Context id")),
    responses(
        (status = 200, description = "Context found", body = SessionContext),
        (status = 404, description = "Context not found")
    ),
    tag = "contexts"
)]
pub async fn get_context(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionContext>> {
    Ok(Json(state.hub.contexts().get_context(&id)?))
}

/// Full trace history of a context in sequence order
#[utoipa::path(
    get,
    path = "/api/contexts/{id}/traces",
    params(("id" = String, Path, description = "Context id")),
    responses(
        (status = 200, description = "Ordered traces", body = Vec<ContextTrace>),
        (status = 404, description = "Context not found")
    ),
    tag = "contexts"
)]
pub async fn get_context_traces(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ContextTrace>>> {
    Ok(Json(state.hub.contexts().get_context_traces(&id)?))
}

#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    params(("id" = String, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task state", body = TaskSnapshot),
        (status = 404, description = "Unknown or pruned task")
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskSnapshot>> {
    state
        .hub
        .dispatcher()
        .task(&id)
        .map(Json)
        .ok_or(AppError::TaskNotFound(id))
}
