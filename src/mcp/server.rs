use crate::hub::Hub;
use crate::memory::{ContextFilter, ContextStatus};
use crate::types::AppError;
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Parameters for listing agents
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ListAgentsParams {
    /// Only routable agents offering this capability
    pub capability: Option<String>,
}

/// Parameters for listing contexts
#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ListContextsParams {
    /// active, paused, completed or failed
    pub status: Option<String>,
    /// Current stage name
    pub stage: Option<String>,
    /// Maximum number of contexts
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct ContextParams {
    pub context_id: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct StartResearchParams {
    /// Research question
    pub query: String,
    /// Optional id for the new context
    pub context_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
pub struct TaskParams {
    pub task_id: String,
}

/// MCP server exposing hub inspection and research control as tools
#[derive(Clone)]
pub struct HubMcpServer {
    hub: Arc<Hub>,
    tool_router: ToolRouter<Self>,
}

fn json_result<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn error_result(err: AppError) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(format!(
        "{}: {}",
        err.code(),
        err
    ))]))
}

#[tool_router]
impl HubMcpServer {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "List registered agents with health, load and circuit state")]
    async fn list_agents(
        &self,
        params: Parameters<ListAgentsParams>,
    ) -> Result<CallToolResult, McpError> {
        let registry = self.hub.registry();
        let agents = match params.0.capability {
            Some(capability) => registry.query(&capability),
            None => registry.agents(),
        };
        json_result(&agents)
    }

    #[tool(description = "List research contexts, optionally filtered by status and stage")]
    async fn list_contexts(
        &self,
        params: Parameters<ListContextsParams>,
    ) -> Result<CallToolResult, McpError> {
        let status = match params.0.status.as_deref().map(str::parse::<ContextStatus>) {
            Some(Err(e)) => return error_result(e),
            Some(Ok(status)) => Some(status),
            None => None,
        };
        let filter = ContextFilter {
            status,
            stage: params.0.stage,
            limit: params.0.limit,
        };
        json_result(&self.hub.contexts().list_contexts(&filter))
    }

    #[tool(description = "Get the ordered trace history of a research context")]
    async fn get_context_traces(
        &self,
        params: Parameters<ContextParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.hub.contexts().get_context_traces(&params.0.context_id) {
            Ok(traces) => json_result(&traces),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Start a research workflow for a query")]
    async fn start_research(
        &self,
        params: Parameters<StartResearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let StartResearchParams { query, context_id } = params.0;
        match self.hub.research().start(&query, context_id.as_deref(), None) {
            Ok(context) => json_result(&context),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Resume a paused or failed research context at its current stage")]
    async fn resume_context(
        &self,
        params: Parameters<ContextParams>,
    ) -> Result<CallToolResult, McpError> {
        match self.hub.research().resume(&params.0.context_id, None) {
            Ok(context) => json_result(&context),
            Err(e) => error_result(e),
        }
    }

    #[tool(description = "Get the state of a dispatched task")]
    async fn get_task(&self, params: Parameters<TaskParams>) -> Result<CallToolResult, McpError> {
        match self.hub.dispatcher().task(&params.0.task_id) {
            Some(task) => json_result(&task),
            None => error_result(AppError::TaskNotFound(params.0.task_id)),
        }
    }

    #[tool(description = "Hub liveness and load summary")]
    async fn hub_health(&self) -> Result<CallToolResult, McpError> {
        json_result(&self.hub.health_report())
    }
}

#[tool_handler]
impl ServerHandler for HubMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "ares-mcp-server".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "A.R.E.S MCP Hub - inspect agents, contexts and tasks; start and resume research"
                    .into(),
            ),
        }
    }
}

/// Serve the hub's tools over stdio until the client disconnects.
pub async fn start_stdio_server(hub: Arc<Hub>) -> crate::types::Result<()> {
    use rmcp::{transport::io::stdio, ServiceExt};

    let service = HubMcpServer::new(hub)
        .serve(stdio())
        .await
        .map_err(|e| AppError::Internal(format!("MCP server error: {}", e)))?;
    service
        .waiting()
        .await
        .map_err(|e| AppError::Internal(format!("MCP server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::toml_config::{HubConfig, HubConfigManager};

    fn server() -> HubMcpServer {
        let config = Arc::new(HubConfigManager::from_config(HubConfig::default()));
        HubMcpServer::new(Arc::new(Hub::new(config)))
    }

    #[test]
    fn test_server_info_enables_tools() {
        let info = server().get_info();
        assert_eq!(info.server_info.name, "ares-mcp-server");
        assert!(info.capabilities.tools.is_some());
    }

    #[tokio::test]
    async fn test_unknown_task_is_tool_error() {
        let result = server()
            .get_task(Parameters(TaskParams {
                task_id: "missing".into(),
            }))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
    }

    #[tokio::test]
    async fn test_start_research_creates_context() {
        let server = server();
        let result = server
            .start_research(Parameters(StartResearchParams {
                query: "microbiome and sleep".into(),
                context_id: Some("ctx-mcp".into()),
            }))
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
        assert!(server.hub.contexts().get_context("ctx-mcp").is_ok());
    }
}
