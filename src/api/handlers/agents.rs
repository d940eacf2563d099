use crate::agents::AgentSnapshot;
use crate::AppState;
use axum::{extract::State, Json};

/// List every registered agent, reachable or not
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "Registered agents ordered by id", body = Vec<AgentSnapshot>)
    ),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSnapshot>> {
    Json(state.hub.registry().agents())
}
