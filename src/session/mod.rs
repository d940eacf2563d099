//! Connection sessions
//!
//! Every live connection (agent or client) owns one session: an id and an
//! unbounded outbound queue drained by the connection's writer task. The
//! manager maps agent identities onto sessions so the dispatcher can address
//! agents without knowing about sockets.

use crate::agents::AgentRegistry;
use crate::dispatch::TaskTransport;
use crate::protocol::{Envelope, JsonRpcResponse};
use crate::types::{AppError, Result};
use crate::utils::toml_config::HubConfigManager;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frame queued for a session's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Envelope(Envelope),
    Rpc(JsonRpcResponse),
}

impl Outbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Envelope(env) => env.kind(),
            Outbound::Rpc(_) => "jsonrpc",
        }
    }

    pub fn to_json(&self) -> String {
        match self {
            Outbound::Envelope(env) => env.to_json(),
            Outbound::Rpc(resp) => resp.to_json(),
        }
    }
}

impl From<Envelope> for Outbound {
    fn from(envelope: Envelope) -> Self {
        Outbound::Envelope(envelope)
    }
}

impl From<JsonRpcResponse> for Outbound {
    fn from(response: JsonRpcResponse) -> Self {
        Outbound::Rpc(response)
    }
}

#[derive(Debug)]
struct SessionHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    agent_id: Option<String>,
    opened_at: DateTime<Utc>,
}

pub struct SessionManager {
    sessions: DashMap<String, SessionHandle>,
    registry: Arc<AgentRegistry>,
    config: Arc<HubConfigManager>,
}

impl SessionManager {
    pub fn new(config: Arc<HubConfigManager>, registry: Arc<AgentRegistry>) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            config,
        }
    }

    /// Open a session; the receiver feeds the connection writer.
    pub fn open(&self) -> Result<(String, mpsc::UnboundedReceiver<Outbound>)> {
        let max = self.config.config().server.max_connections;
        if self.sessions.len() >= max {
            warn!(max_connections = max, "Rejecting connection");
            return Err(AppError::CapacityExceeded(format!(
                "{} sessions already open",
                max
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id.clone(),
            SessionHandle {
                tx,
                agent_id: None,
                opened_at: Utc::now(),
            },
        );
        info!(session_id = %session_id, "Session opened");
        Ok((session_id, rx))
    }

    /// Queue a frame for the session's writer.
    pub fn send(&self, session_id: &str, frame: impl Into<Outbound>) -> Result<()> {
        let frame = frame.into();
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        debug!(session_id = %session_id, kind = frame.kind(), "Queue frame");
        session
            .tx
            .send(frame)
            .map_err(|_| AppError::SessionNotFound(format!("{} (writer closed)", session_id)))
    }

    pub fn bind_agent(&self, session_id: &str, agent_id: &str) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;
        session.agent_id = Some(agent_id.to_string());
        Ok(())
    }

    pub fn agent_of(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .and_then(|s| s.agent_id.clone())
    }

    pub fn opened_at(&self, session_id: &str) -> Option<DateTime<Utc>> {
        self.sessions.get(session_id).map(|s| s.opened_at)
    }

    /// Send to every routable agent offering `capability`.
    pub fn broadcast_to_capability(&self, capability: &str, envelope: &Envelope) -> usize {
        self.registry
            .query(capability)
            .into_iter()
            .filter_map(|agent| agent.session_id)
            .filter(|session_id| self.send(session_id, envelope.clone()).is_ok())
            .count()
    }

    /// Tear the session down and evict the agent bound to it, if that agent
    /// has not re-registered elsewhere.
    pub fn close(&self, session_id: &str) -> Option<String> {
        let (_, handle) = self.sessions.remove(session_id)?;
        info!(session_id = %session_id, "Session closed");

        let agent_id = handle.agent_id?;
        if self.registry.session_of(&agent_id).as_deref() == Some(session_id) {
            self.registry.evict(&agent_id);
        }
        Some(agent_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl TaskTransport for SessionManager {
    fn deliver_to_agent(&self, agent_id: &str, envelope: Envelope) -> Result<()> {
        let session_id = self
            .registry
            .session_of(agent_id)
            .ok_or_else(|| AppError::SessionNotFound(format!("no session for agent {}", agent_id)))?;
        self.send(&session_id, envelope)
    }

    fn deliver_to_session(&self, session_id: &str, envelope: Envelope) -> Result<()> {
        self.send(session_id, envelope)
    }
}
