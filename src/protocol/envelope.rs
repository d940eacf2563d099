use super::ProtocolError;
use crate::types::{AppError, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

/// Every message kind accepted on the wire.
pub const MESSAGE_KINDS: [&str; 12] = [
    "agent_register",
    "heartbeat",
    "ping",
    "pong",
    "query_capabilities",
    "research_action",
    "task_submit",
    "task_accepted",
    "task_result",
    "agent_response",
    "registration_confirmed",
    "health_check",
];

// ============= Message Kinds =============

/// Closed set of hub messages, each with its own payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Message {
    AgentRegister(AgentRegister),
    Heartbeat(Heartbeat),
    Ping(Empty),
    Pong(Empty),
    QueryCapabilities(QueryCapabilities),
    ResearchAction(ResearchAction),
    TaskSubmit(TaskSubmit),
    TaskAccepted(TaskAccepted),
    TaskResult(TaskResult),
    AgentResponse(AgentResponse),
    RegistrationConfirmed(RegistrationConfirmed),
    HealthCheck(HealthCheck),
}

impl Message {
    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AgentRegister(_) => "agent_register",
            Message::Heartbeat(_) => "heartbeat",
            Message::Ping(_) => "ping",
            Message::Pong(_) => "pong",
            Message::QueryCapabilities(_) => "query_capabilities",
            Message::ResearchAction(_) => "research_action",
            Message::TaskSubmit(_) => "task_submit",
            Message::TaskAccepted(_) => "task_accepted",
            Message::TaskResult(_) => "task_result",
            Message::AgentResponse(_) => "agent_response",
            Message::RegistrationConfirmed(_) => "registration_confirmed",
            Message::HealthCheck(_) => "health_check",
        }
    }
}

/// Payload for messages that carry no data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

fn default_max_concurrent() -> u32 {
    1
}

/// `agent_register` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegister {
    pub agent_id: String,
    pub agent_type: String,
    pub capabilities: Vec<String>,
    #[serde(alias = "max_concurrency", default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Per-task timeout in seconds declared by the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `heartbeat` payload. The agent id defaults to the one bound to the session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
}

/// Operations available through `research_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchOp {
    Start,
    Resume,
    Pause,
    Status,
    /// Also sent by the hub to an agent to abandon a task.
    CancelTask,
}

/// `research_action` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchAction {
    pub action: ResearchOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl ResearchAction {
    /// Cancellation notice sent to the agent executing `task_id`.
    pub fn cancel(task_id: &str, reason: &str) -> Self {
        Self {
            action: ResearchOp::CancelTask,
            context_id: None,
            query: None,
            task_id: Some(task_id.to_string()),
            params: json!({ "reason": reason }),
        }
    }
}

/// `task_submit` payload, used both inbound (client → hub) and outbound
/// (hub → agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl TaskSubmit {
    /// Capability the task is addressed to; falls back to the action name.
    pub fn capability(&self) -> &str {
        self.capability.as_deref().unwrap_or(&self.action)
    }
}

/// `task_accepted` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// `task_result` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// `agent_response` payload: the generic reply, including protocol errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl AgentResponse {
    pub fn ok(in_reply_to: impl Into<String>, result: Value) -> Self {
        Self {
            in_reply_to: Some(in_reply_to.into()),
            success: true,
            result,
            error: None,
        }
    }

    pub fn failure(in_reply_to: impl Into<String>, err: &AppError) -> Self {
        Self {
            in_reply_to: Some(in_reply_to.into()),
            success: false,
            result: Value::Null,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// `registration_confirmed` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfirmed {
    pub agent_id: String,
    pub session_id: String,
    pub heartbeat_interval_secs: u64,
}

/// Hub liveness snapshot returned by `health_check` and `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub sessions: usize,
    pub agents: usize,
    pub healthy_agents: usize,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub contexts: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<HealthReport>,
}

// ============= Envelope =============

/// A timestamped message with optional correlation ids.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: Message,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(alias = "params")]
    data: Option<Value>,
    timestamp: Option<String>,
    client_id: Option<String>,
    request_id: Option<String>,
}

impl Envelope {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            client_id: None,
            request_id: None,
        }
    }

    /// New outbound call with a freshly generated request id.
    pub fn request(message: Message) -> Self {
        Self::new(message).with_request_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Reply to `self`, echoing its request id.
    pub fn reply(&self, message: Message) -> Self {
        let env = Self::new(message);
        match &self.request_id {
            Some(id) => env.with_request_id(id.clone()),
            None => env,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Validate required fields, then decode the typed payload.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = raw.kind.ok_or(ProtocolError::MissingField("type"))?;
        let data = raw.data.ok_or(ProtocolError::MissingField("data"))?;
        let ts = raw.timestamp.ok_or(ProtocolError::MissingField("timestamp"))?;
        let timestamp = DateTime::parse_from_rfc3339(&ts)
            .map_err(|_| ProtocolError::InvalidTimestamp(ts.clone()))?
            .with_timezone(&Utc);

        if !MESSAGE_KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        let message: Message = serde_json::from_value(json!({ "type": kind, "data": data }))
            .map_err(|e| ProtocolError::InvalidPayload {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            message,
            timestamp,
            client_id: raw.client_id,
            request_id: raw.request_id,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
