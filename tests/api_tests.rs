//! REST surface tests using axum-test.

use ares_mcp::{
    agents::AgentRegistration,
    api::routes,
    dispatch::TaskRequest,
    types::AgentType,
    AppState, HubConfig, HubConfigManager,
};
use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};
use std::sync::Arc;

fn state() -> AppState {
    AppState::new(Arc::new(HubConfigManager::from_config(HubConfig::default())))
}

fn server(state: &AppState) -> TestServer {
    TestServer::new(routes::app(state.clone())).unwrap()
}

// ============= Health =============

#[tokio::test]
async fn test_health_reports_counts() {
    let state = state();
    state
        .hub
        .registry()
        .register(AgentRegistration::new(
            "lit-1",
            AgentType::LiteratureSearch,
            ["literature_search"],
            2,
        ))
        .unwrap();
    let server = server(&state);

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents"], 1);
    assert_eq!(body["healthy_agents"], 1);
    assert_eq!(body["queued_tasks"], 0);
}

#[tokio::test]
async fn test_stats_counts_submissions() {
    let state = state();
    state
        .hub
        .dispatcher()
        .submit(TaskRequest::new("literature_search", "search", json!({})))
        .unwrap();
    let server = server(&state);

    let body: Value = server.get("/api/stats").await.json();
    assert_eq!(body["submitted_total"], 1);
    assert_eq!(body["queued"], 1);
}

// ============= Agents =============

#[tokio::test]
async fn test_list_agents() {
    let state = state();
    for id in ["planner-1", "lit-1"] {
        state
            .hub
            .registry()
            .register(AgentRegistration::new(id, AgentType::Planning, ["plan_research"], 1))
            .unwrap();
    }
    let server = server(&state);

    let body: Value = server.get("/api/agents").await.json();
    let agents = body.as_array().unwrap();
    assert_eq!(agents.len(), 2);
    assert_eq!(agents[0]["agent_id"], "lit-1");
    assert_eq!(agents[0]["circuit"], "closed");
    assert_eq!(agents[1]["health"], "healthy");
}

// ============= Contexts =============

#[tokio::test]
async fn test_context_endpoints() {
    let state = state();
    state
        .hub
        .research()
        .start("antibiotic resistance", Some("ctx-api"), None)
        .unwrap();
    let server = server(&state);

    let context: Value = server.get("/api/contexts/ctx-api").await.json();
    assert_eq!(context["status"], "active");
    assert_eq!(context["current_stage"], "plan");

    let traces: Value = server.get("/api/contexts/ctx-api/traces").await.json();
    let traces = traces.as_array().unwrap();
    assert!(!traces.is_empty());
    assert_eq!(traces[0]["sequence"], 1);
}

#[tokio::test]
async fn test_list_contexts_filters() {
    let state = state();
    let contexts = state.hub.contexts();
    contexts.create_context(Some("a")).unwrap();
    contexts.create_context(Some("b")).unwrap();
    contexts
        .update_context_status("b", ares_mcp::ContextStatus::Paused, Some("search"))
        .unwrap();
    let server = server(&state);

    let all: Value = server.get("/api/contexts").await.json();
    assert_eq!(all.as_array().unwrap().len(), 2);

    let paused: Value = server
        .get("/api/contexts")
        .add_query_param("status", "paused")
        .await
        .json();
    assert_eq!(paused.as_array().unwrap().len(), 1);
    assert_eq!(paused[0]["context_id"], "b");

    let limited: Value = server
        .get("/api/contexts")
        .add_query_param("limit", 1)
        .await
        .json();
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_resources_are_404() {
    let state = state();
    let server = server(&state);

    let response = server.get("/api/contexts/nope").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: Value = response.json();
    assert_eq!(body["code"], "CONTEXT_NOT_FOUND");

    let response = server.get("/api/tasks/nope").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_task_lookup() {
    let state = state();
    let task_id = state
        .hub
        .dispatcher()
        .submit(
            TaskRequest::new("literature_search", "search", json!({})).with_task_id("t-api"),
        )
        .unwrap();
    let server = server(&state);

    let body: Value = server.get(&format!("/api/tasks/{}", task_id)).await.json();
    assert_eq!(body["task_id"], "t-api");
    assert_eq!(body["status"], "submitted");
    assert_eq!(body["attempt"], 0);
}

// ============= OpenAPI =============

#[tokio::test]
async fn test_openapi_document_lists_paths() {
    let state = state();
    let server = server(&state);

    let doc: Value = server.get("/api-docs/openapi.json").await.json();
    let paths = doc["paths"].as_object().unwrap();
    for path in [
        "/health",
        "/api/agents",
        "/api/contexts",
        "/api/contexts/{id}",
        "/api/contexts/{id}/traces",
        "/api/tasks/{id}",
        "/api/stats",
    ] {
        assert!(paths.contains_key(path), "missing {}", path);
    }
}
