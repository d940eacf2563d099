use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

// ============= Agent Types =============

/// Closed set of agent roles the hub knows how to route to.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    /// Coordinates whole research workflows.
    ResearchManager,
    /// Queries bibliographic sources.
    LiteratureSearch,
    /// PRISMA-style screening of search hits.
    ScreeningPrisma,
    /// Synthesizes and reviews findings.
    SynthesisReview,
    /// Drafts reports.
    Writer,
    /// Produces research plans.
    Planning,
    /// Runs generic actions.
    Executor,
    /// Stores and recalls research memory.
    Memory,
}

impl AgentType {
    /// Every known agent type, in declaration order.
    pub const ALL: [AgentType; 8] = [
        AgentType::ResearchManager,
        AgentType::LiteratureSearch,
        AgentType::ScreeningPrisma,
        AgentType::SynthesisReview,
        AgentType::Writer,
        AgentType::Planning,
        AgentType::Executor,
        AgentType::Memory,
    ];

    /// Wire name of the agent type.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ResearchManager => "research_manager",
            AgentType::LiteratureSearch => "literature_search",
            AgentType::ScreeningPrisma => "screening_prisma",
            AgentType::SynthesisReview => "synthesis_review",
            AgentType::Writer => "writer",
            AgentType::Planning => "planning",
            AgentType::Executor => "executor",
            AgentType::Memory => "memory",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        AgentType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.trim())
            .ok_or_else(|| AppError::InvalidInput(format!("unknown agent type '{}'", s)))
    }
}

/// Liveness classification of a registered agent.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fresh heartbeat and spare capacity.
    Healthy,
    /// Fresh heartbeat but every slot is busy.
    Degraded,
    /// Missed too many heartbeats; excluded from routing.
    Unreachable,
}

// ============= Task Types =============

/// Lifecycle of a routed task.
#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    Dispatched,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }
}

// ============= Error Types =============

#[derive(Debug, Clone, thiserror::Error)]
pub enum AppError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Agent already registered: {0}")]
    DuplicateRegistration(String),

    #[error("Agent type not allowed: {0}")]
    AgentTypeNotAllowed(String),

    #[error("No capable agent: {0}")]
    NoCapableAgent(String),

    #[error("Dispatch timed out: {0}")]
    DispatchTimeout(String),

    #[error("Task {task_id} failed after {attempts} attempts: {reason}")]
    MaxRetriesExceeded {
        task_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("Circuit open for agent {0}")]
    CircuitOpen(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Connection limit reached: {0}")]
    CapacityExceeded(String),

    #[error("Task backlog full: {0}")]
    BacklogFull(String),

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable reason code carried in wire replies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Protocol(_) => "PROTOCOL_ERROR",
            AppError::UnknownAgent(_) => "UNKNOWN_AGENT",
            AppError::DuplicateRegistration(_) => "DUPLICATE_REGISTRATION",
            AppError::AgentTypeNotAllowed(_) => "AGENT_TYPE_NOT_ALLOWED",
            AppError::NoCapableAgent(_) => "NO_CAPABLE_AGENT",
            AppError::DispatchTimeout(_) => "DISPATCH_TIMEOUT",
            AppError::MaxRetriesExceeded { .. } => "MAX_RETRIES_EXCEEDED",
            AppError::CircuitOpen(_) => "CIRCUIT_OPEN",
            AppError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            AppError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            AppError::BacklogFull(_) => "BACKLOG_FULL",
            AppError::ContextNotFound(_) => "CONTEXT_NOT_FOUND",
            AppError::TaskNotFound(_) => "TASK_NOT_FOUND",
            AppError::InvalidTransition(_) => "INVALID_TRANSITION",
            AppError::Cancelled(_) => "CANCELLED",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            AppError::Protocol(_) | AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::UnknownAgent(_)
            | AppError::SessionNotFound(_)
            | AppError::ContextNotFound(_)
            | AppError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            AppError::DuplicateRegistration(_)
            | AppError::InvalidTransition(_)
            | AppError::Cancelled(_) => StatusCode::CONFLICT,
            AppError::AgentTypeNotAllowed(_) => StatusCode::FORBIDDEN,
            AppError::NoCapableAgent(_)
            | AppError::CircuitOpen(_)
            | AppError::CapacityExceeded(_)
            | AppError::BacklogFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::DispatchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::MaxRetriesExceeded { .. } => StatusCode::BAD_GATEWAY,
            AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
