use crate::api::handlers::{agents, contexts, health, ws};
use crate::api::ApiDoc;
use crate::AppState;
use axum::{routing::get, Json, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Routes nested under `/api`.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/agents", get(agents::list_agents))
        .route("/contexts", get(contexts::list_contexts))
        .route("/contexts/{id}", get(contexts::get_context))
        .route("/contexts/{id}/traces", get(contexts::get_context_traces))
        .route("/tasks/{id}", get(contexts::get_task))
        .route("/stats", get(health::stats))
}

/// Complete application: WebSocket endpoint, health, REST API and OpenAPI
/// document, with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(health::health))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .nest("/api", create_router());

    #[cfg(feature = "swagger-ui")]
    let router = router.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    );

    router
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
