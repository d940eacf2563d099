use crate::protocol::{ErrorBody, TaskSubmit};
use crate::types::{AgentType, AppError, Result, TaskStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use utoipa::ToSchema;

/// A unit of work addressed to a capability.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_id: Option<String>,
    pub context_id: Option<String>,
    pub capability: String,
    pub action: String,
    pub agent_type: Option<AgentType>,
    pub payload: Value,
    pub priority: u8,
    pub timeout: Option<Duration>,
    pub stage: Option<String>,
    pub origin_session: Option<String>,
}

impl TaskRequest {
    pub fn new(capability: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            task_id: None,
            context_id: None,
            capability: capability.into(),
            action: action.into(),
            agent_type: None,
            payload,
            priority: 0,
            timeout: None,
            stage: None,
            origin_session: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_agent_type(mut self, agent_type: AgentType) -> Self {
        self.agent_type = Some(agent_type);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_origin(mut self, session_id: impl Into<String>) -> Self {
        self.origin_session = Some(session_id.into());
        self
    }

    /// Build from a wire `task_submit` sent by `origin`.
    pub fn from_submit(submit: &TaskSubmit, origin: Option<&str>) -> Result<Self> {
        let agent_type = submit
            .agent_type
            .as_deref()
            .map(str::parse::<AgentType>)
            .transpose()?;

        Ok(Self {
            task_id: submit.task_id.clone(),
            context_id: submit.context_id.clone(),
            capability: submit.capability().to_string(),
            action: submit.action.clone(),
            agent_type,
            payload: submit.payload.clone(),
            priority: submit.priority.unwrap_or(0),
            timeout: submit.timeout.filter(|s| *s > 0).map(Duration::from_secs),
            stage: submit.stage.clone(),
            origin_session: origin.map(str::to_string),
        })
    }
}

/// Dispatcher-owned task record.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub id: String,
    pub request: TaskRequest,
    pub status: TaskStatus,
    pub seq: u64,
    pub attempt: u32,
    pub assigned_agent: Option<String>,
    pub failed_agents: BTreeSet<String>,
    pub last_error: Option<AppError>,
    pub result: Option<Value>,
    pub cancelled: bool,
    pub trial: bool,
    pub request_id: Option<String>,
    pub dispatched_at: Option<Instant>,
    pub attempt_deadline: Option<Instant>,
    pub backlog_deadline: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: String, request: TaskRequest, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            request,
            status: TaskStatus::Submitted,
            seq,
            attempt: 0,
            assigned_agent: None,
            failed_agents: BTreeSet::new(),
            last_error: None,
            result: None,
            cancelled: false,
            trial: false,
            request_id: None,
            dispatched_at: None,
            attempt_deadline: None,
            backlog_deadline: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, TaskStatus::Dispatched | TaskStatus::Running)
    }

    /// Trace stage label for this task.
    pub fn stage_label(&self) -> String {
        self.request
            .stage
            .clone()
            .unwrap_or_else(|| "dispatch".to_string())
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: self.id.clone(),
            context_id: self.request.context_id.clone(),
            capability: self.request.capability.clone(),
            action: self.request.action.clone(),
            stage: self.request.stage.clone(),
            status: self.status,
            priority: self.request.priority,
            attempt: self.attempt,
            assigned_agent: self.assigned_agent.clone(),
            failed_agents: self.failed_agents.iter().cloned().collect(),
            result: self.result.clone(),
            error: self.last_error.as_ref().map(|e| ErrorBody {
                code: e.code().to_string(),
                message: e.to_string(),
            }),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Observability view of a task.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskSnapshot {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub capability: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub status: TaskStatus,
    pub priority: u8,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    pub failed_agents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal notification for one task, published once.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub task_id: String,
    pub context_id: Option<String>,
    pub stage: Option<String>,
    pub origin_session: Option<String>,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    pub attempts: u32,
    pub result: Value,
    pub error: Option<AppError>,
    pub cancelled: bool,
}

impl DispatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
