//! HTTP and WebSocket surface
//!
//! Built on axum. Agents and clients talk to the hub over a single WebSocket
//! endpoint; the REST endpoints are read-only views for operators.
//!
//! # Endpoints
//!
//! - `GET /ws` - hub session (JSON envelopes and JSON-RPC control calls)
//! - `GET /health` - liveness and load summary
//! - `GET /api/agents` - registered agents with health, load and circuit state
//! - `GET /api/contexts?status=&stage=&limit=` - research contexts
//! - `GET /api/contexts/{id}` - one context
//! - `GET /api/contexts/{id}/traces` - ordered trace history
//! - `GET /api/tasks/{id}` - task state until pruned
//! - `GET /api/stats` - dispatcher queue depth and counters
//! - `GET /api-docs/openapi.json` - OpenAPI document
//!
//! With the `swagger-ui` feature, interactive documentation is served at
//! `/swagger-ui/`.

/// Request handlers.
pub mod handlers;
/// Router assembly.
pub mod routes;

use crate::agents::AgentSnapshot;
use crate::dispatch::{CircuitState, DispatchStats, TaskSnapshot};
use crate::memory::{ContextStatus, ContextTrace, SessionContext};
use crate::protocol::{ErrorBody, HealthReport};
use crate::types::{AgentType, HealthStatus, TaskStatus};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(title = "A.R.E.S MCP Hub", description = "Operator API of the research agent hub"),
    paths(
        handlers::health::health,
        handlers::agents::list_agents,
        handlers::contexts::list_contexts,
        handlers::contexts::get_context,
        handlers::contexts::get_context_traces,
        handlers::contexts::get_task,
        handlers::health::stats,
    ),
    components(schemas(
        HealthReport,
        AgentSnapshot,
        AgentType,
        HealthStatus,
        CircuitState,
        SessionContext,
        ContextStatus,
        ContextTrace,
        TaskSnapshot,
        TaskStatus,
        ErrorBody,
        DispatchStats,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "agents", description = "Agent registry"),
        (name = "contexts", description = "Research contexts and traces"),
        (name = "tasks", description = "Dispatched tasks"),
    )
)]
pub struct ApiDoc;
