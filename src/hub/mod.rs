//! Hub composition root
//!
//! [`Hub`] wires the session layer, agent registry, dispatcher, context store
//! and research coordinator together and routes every decoded frame to the
//! component that owns it. Transports (the WebSocket handler, tests) only
//! call [`Hub::connect`], [`Hub::handle_text`] and [`Hub::disconnect`].

use crate::agents::{AgentRegistration, AgentRegistry};
use crate::dispatch::{CircuitBreakerRegistry, Dispatcher, TaskRequest};
use crate::memory::ContextManager;
use crate::protocol::{
    parse_frame, AgentRegister, AgentResponse, Empty, Envelope, Frame, HealthCheck, HealthReport,
    JsonRpcRequest, JsonRpcResponse, Message, ProtocolError, RegistrationConfirmed,
    ResearchAction, ResearchOp, RpcMethod, TaskAccepted, MESSAGE_KINDS, PROTOCOL_VERSION,
};
use crate::research::ResearchCoordinator;
use crate::session::{Outbound, SessionManager};
use crate::types::{AgentType, AppError, Result, TaskStatus};
use crate::utils::toml_config::HubConfigManager;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Hub {
    config: Arc<HubConfigManager>,
    sessions: Arc<SessionManager>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    contexts: Arc<ContextManager>,
    research: Arc<ResearchCoordinator>,
    started_at: Instant,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub fn new(config: Arc<HubConfigManager>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let registry = Arc::new(AgentRegistry::new(Arc::clone(&config), breakers));
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&config),
            Arc::clone(&registry),
        ));
        let contexts = Arc::new(ContextManager::new());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&contexts),
            sessions.clone(),
        ));
        let research = Arc::new(ResearchCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&contexts),
            Arc::clone(&dispatcher),
            sessions.clone(),
        ));

        Self {
            config,
            sessions,
            registry,
            dispatcher,
            contexts,
            research,
            started_at: Instant::now(),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the dispatcher workers, timeout watch, registry sweep and
    /// pipeline driver. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut background = self.background.lock();
        if !background.is_empty() {
            return;
        }
        background.push(self.research.start_driver());
        background.extend(self.dispatcher.start());
        background.push(self.registry.start_sweep_task());
        info!(tasks = background.len(), "Hub started");
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        self.registry.shutdown();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        info!("Hub stopped");
    }

    pub fn config(&self) -> &Arc<HubConfigManager> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn research(&self) -> &Arc<ResearchCoordinator> {
        &self.research
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    // ============= Connection Lifecycle =============

    pub fn connect(&self) -> Result<(String, mpsc::UnboundedReceiver<Outbound>)> {
        self.sessions.open()
    }

    /// Tear down a session: evict its agent, retry that agent's in-flight
    /// work elsewhere and cancel the tasks the session submitted.
    pub fn disconnect(&self, session_id: &str) {
        let agent_id = self.sessions.close(session_id);
        let requeued = agent_id
            .as_deref()
            .map(|agent| self.dispatcher.on_agent_disconnected(agent, Instant::now()))
            .unwrap_or(0);
        let cancelled = self.dispatcher.cancel_session_tasks(session_id);

        info!(
            session_id = %session_id,
            agent_id = ?agent_id,
            requeued,
            cancelled,
            "Session disconnected"
        );
    }

    // ============= Inbound Frames =============

    /// Decode and route one text frame. Replies are queued on the session;
    /// bad frames get an error reply and never close the connection.
    pub fn handle_text(&self, session_id: &str, text: &str) {
        match parse_frame(text) {
            Ok(Frame::Rpc(request)) => {
                let response = self.handle_rpc(&request);
                self.reply(session_id, response);
            }
            Ok(Frame::Envelope(envelope)) => {
                if let Some(reply) = self.handle_envelope(session_id, &envelope) {
                    self.reply(session_id, reply);
                }
            }
            Err(e) => self.reject_frame(session_id, &e),
        }
    }

    /// Binary frames carry the same JSON as text frames.
    pub fn handle_binary(&self, session_id: &str, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(session_id, text),
            Err(e) => {
                self.reject_frame(session_id, &ProtocolError::InvalidEncoding(e.to_string()))
            }
        }
    }

    fn reject_frame(&self, session_id: &str, err: &ProtocolError) {
        warn!(session_id = %session_id, error = %err, "Rejected frame");
        self.reply(session_id, protocol_error_reply(err));
    }

    fn reply(&self, session_id: &str, frame: impl Into<Outbound>) {
        if let Err(e) = self.sessions.send(session_id, frame) {
            debug!(session_id = %session_id, error = %e, "Reply dropped");
        }
    }

    fn handle_rpc(&self, request: &JsonRpcRequest) -> JsonRpcResponse {
        match request.rpc_method() {
            Ok(RpcMethod::Ping) => JsonRpcResponse::result(request.id.clone(), json!("pong")),
            Ok(RpcMethod::Initialize) => JsonRpcResponse::result(
                request.id.clone(),
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "messageTypes": MESSAGE_KINDS,
                }),
            ),
            Err(e) => JsonRpcResponse::error(&e),
        }
    }

    /// Route a decoded envelope; returns the reply, if the message has one.
    pub fn handle_envelope(&self, session_id: &str, envelope: &Envelope) -> Option<Envelope> {
        let in_reply_to = envelope
            .request_id
            .clone()
            .unwrap_or_else(|| envelope.kind().to_string());

        match self.route(session_id, envelope) {
            Ok(reply) => reply.map(|message| envelope.reply(message)),
            Err(e) => {
                warn!(
                    session_id = %session_id,
                    kind = envelope.kind(),
                    code = e.code(),
                    error = %e,
                    "Request failed"
                );
                Some(envelope.reply(Message::AgentResponse(AgentResponse::failure(
                    in_reply_to,
                    &e,
                ))))
            }
        }
    }

    fn route(&self, session_id: &str, envelope: &Envelope) -> Result<Option<Message>> {
        let in_reply_to = || {
            envelope
                .request_id
                .clone()
                .unwrap_or_else(|| envelope.kind().to_string())
        };

        match &envelope.message {
            Message::AgentRegister(register) => self.register(session_id, register).map(Some),
            Message::Heartbeat(heartbeat) => {
                let agent_id = self.acting_agent(session_id, heartbeat.agent_id.as_deref())?;
                self.registry.heartbeat(&agent_id)?;
                Ok(None)
            }
            Message::Ping(_) => Ok(Some(Message::Pong(Empty {}))),
            Message::QueryCapabilities(query) => {
                let agents = match &query.capability {
                    Some(capability) => self.registry.query(capability),
                    None => self.registry.agents(),
                };
                Ok(Some(Message::AgentResponse(AgentResponse::ok(
                    in_reply_to(),
                    json!({ "agents": agents }),
                ))))
            }
            Message::ResearchAction(action) => {
                let result = self.research_action(session_id, action)?;
                Ok(Some(Message::AgentResponse(AgentResponse::ok(
                    in_reply_to(),
                    result,
                ))))
            }
            Message::TaskSubmit(submit) => {
                let request = TaskRequest::from_submit(submit, Some(session_id))?;
                let context_id = request.context_id.clone();
                let task_id = self.dispatcher.submit(request)?;
                Ok(Some(Message::TaskAccepted(TaskAccepted {
                    task_id,
                    context_id,
                    status: TaskStatus::Submitted,
                    agent_id: None,
                })))
            }
            Message::TaskAccepted(accepted) => {
                let agent_id = self.acting_agent(session_id, accepted.agent_id.as_deref())?;
                let request_id = echoed_request_id(envelope)?;
                self.dispatcher
                    .mark_running(&accepted.task_id, &agent_id, Some(request_id))?;
                Ok(None)
            }
            Message::TaskResult(result) => {
                let agent_id = self.acting_agent(session_id, result.agent_id.as_deref())?;
                let request_id = echoed_request_id(envelope)?;
                self.dispatcher.on_task_result(
                    &agent_id,
                    Some(request_id),
                    result,
                    Instant::now(),
                )?;
                Ok(None)
            }
            Message::HealthCheck(_) => Ok(Some(Message::HealthCheck(HealthCheck {
                report: Some(self.health_report()),
            }))),
            Message::Pong(_) | Message::AgentResponse(_) | Message::RegistrationConfirmed(_) => {
                debug!(session_id = %session_id, kind = envelope.kind(), "Ignoring reply frame");
                Ok(None)
            }
        }
    }

    fn register(&self, session_id: &str, register: &AgentRegister) -> Result<Message> {
        let agent_type: AgentType = register
            .agent_type
            .parse()
            .map_err(|_| AppError::AgentTypeNotAllowed(register.agent_type.clone()))?;

        let mut registration = AgentRegistration::new(
            register.agent_id.clone(),
            agent_type,
            register.capabilities.iter().cloned(),
            register.max_concurrent,
        )
        .with_session(session_id);
        if let Some(secs) = register.timeout.filter(|s| *s > 0) {
            registration = registration.with_task_timeout(Duration::from_secs(secs));
        }

        self.registry.register(registration)?;
        self.sessions.bind_agent(session_id, &register.agent_id)?;

        Ok(Message::RegistrationConfirmed(RegistrationConfirmed {
            agent_id: register.agent_id.clone(),
            session_id: session_id.to_string(),
            heartbeat_interval_secs: self.config.config().heartbeat.interval_secs,
        }))
    }

    fn research_action(&self, session_id: &str, action: &ResearchAction) -> Result<Value> {
        let context_id = || {
            action
                .context_id
                .as_deref()
                .ok_or_else(|| AppError::InvalidInput("context_id is required".into()))
        };

        let value = match action.action {
            ResearchOp::Start => {
                let query = action
                    .query
                    .as_deref()
                    .ok_or_else(|| AppError::InvalidInput("query is required".into()))?;
                let context = self.research.start(
                    query,
                    action.context_id.as_deref(),
                    Some(session_id),
                )?;
                json!({ "context": context })
            }
            ResearchOp::Resume => {
                let context = self.research.resume(context_id()?, Some(session_id))?;
                json!({ "context": context })
            }
            ResearchOp::Pause => json!({ "context": self.research.pause(context_id()?)? }),
            ResearchOp::Status => serde_json::to_value(self.research.status(context_id()?)?)
                .map_err(|e| AppError::Internal(e.to_string()))?,
            ResearchOp::CancelTask => {
                let task_id = action
                    .task_id
                    .as_deref()
                    .ok_or_else(|| AppError::InvalidInput("task_id is required".into()))?;
                let reason = action
                    .params
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("cancelled by client");
                json!({ "task": self.dispatcher.cancel_task(task_id, reason, true)? })
            }
        };
        Ok(value)
    }

    /// The agent registered on this session. A payload `agent_id` may only
    /// repeat it, never name another agent.
    fn acting_agent(&self, session_id: &str, claimed: Option<&str>) -> Result<String> {
        let bound = self.sessions.agent_of(session_id).ok_or_else(|| {
            AppError::UnknownAgent(format!("session {} has not registered", session_id))
        })?;
        match claimed {
            Some(claimed) if claimed != bound => Err(AppError::UnknownAgent(format!(
                "session {} is registered as {}, not {}",
                session_id, bound, claimed
            ))),
            _ => Ok(bound),
        }
    }

    // ============= Observability =============

    pub fn health_report(&self) -> HealthReport {
        let stats = self.dispatcher.stats();
        HealthReport {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            sessions: self.sessions.len(),
            agents: self.registry.len(),
            healthy_agents: self.registry.healthy_count(),
            queued_tasks: stats.queued,
            in_flight_tasks: stats.in_flight,
            contexts: self.contexts.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        for handle in self.background.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Agent reports must echo the `request_id` of the `task_submit` they answer.
fn echoed_request_id(envelope: &Envelope) -> Result<&str> {
    envelope.request_id.as_deref().ok_or_else(|| {
        AppError::Protocol(format!(
            "{} must echo the request_id of its task_submit",
            envelope.kind()
        ))
    })
}

fn protocol_error_reply(err: &ProtocolError) -> Outbound {
    if err.is_rpc() {
        Outbound::Rpc(JsonRpcResponse::error(err))
    } else {
        let app: AppError = err.clone().into();
        Outbound::Envelope(Envelope::new(Message::AgentResponse(AgentResponse::failure(
            "frame", &app,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::toml_config::HubConfig;

    fn hub() -> Hub {
        Hub::new(Arc::new(HubConfigManager::from_config(HubConfig::default())))
    }

    fn frame(kind: &str, data: Value) -> String {
        json!({ "type": kind, "data": data, "timestamp": "2025-01-01T00:00:00Z" }).to_string()
    }

    fn next(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Value {
        let out = rx.try_recv().unwrap();
        serde_json::from_str(&out.to_json()).unwrap()
    }

    #[test]
    fn test_register_then_confirm() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_text(
            &session,
            &frame(
                "agent_register",
                json!({
                    "agent_id": "lit-1",
                    "agent_type": "literature_search",
                    "capabilities": ["literature_search"],
                    "max_concurrent": 1
                }),
            ),
        );

        let reply = next(&mut rx);
        assert_eq!(reply["type"], "registration_confirmed");
        assert_eq!(reply["data"]["agent_id"], "lit-1");
        assert_eq!(hub.sessions().agent_of(&session).as_deref(), Some("lit-1"));
    }

    #[test]
    fn test_unknown_agent_type_rejected_with_code() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_text(
            &session,
            &frame(
                "agent_register",
                json!({"agent_id": "x", "agent_type": "oracle", "capabilities": ["c"]}),
            ),
        );
        let reply = next(&mut rx);
        assert_eq!(reply["data"]["success"], false);
        assert_eq!(reply["data"]["error"]["code"], "AGENT_TYPE_NOT_ALLOWED");
    }

    #[test]
    fn test_malformed_envelope_keeps_session() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_text(&session, r#"{"type":"ping","data":{}}"#);
        let reply = next(&mut rx);
        assert_eq!(reply["data"]["error"]["code"], "PROTOCOL_ERROR");

        hub.handle_text(&session, &frame("ping", json!({})));
        assert_eq!(next(&mut rx)["type"], "pong");
    }

    #[test]
    fn test_non_utf8_binary_frame_gets_error_reply() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_binary(&session, &[0xff, 0xfe, 0x00]);
        let reply = next(&mut rx);
        assert_eq!(reply["type"], "agent_response");
        assert_eq!(reply["data"]["success"], false);
        assert_eq!(reply["data"]["error"]["code"], "PROTOCOL_ERROR");

        hub.handle_binary(&session, frame("ping", json!({})).as_bytes());
        assert_eq!(next(&mut rx)["type"], "pong");
    }

    #[test]
    fn test_rpc_ping_and_version_check() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_text(&session, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        assert_eq!(next(&mut rx)["result"], "pong");

        hub.handle_text(&session, r#"{"jsonrpc":"1.0","id":2,"method":"ping"}"#);
        let err = next(&mut rx);
        assert_eq!(err["error"]["code"], -32600);
        assert_eq!(err["id"], 2);
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let hub = hub();
        let (session, mut rx) = hub.connect().unwrap();
        let text = json!({
            "type": "health_check",
            "data": {},
            "timestamp": "2025-01-01T00:00:00Z",
            "request_id": "req-42"
        })
        .to_string();
        hub.handle_text(&session, &text);
        let reply = next(&mut rx);
        assert_eq!(reply["request_id"], "req-42");
        assert_eq!(reply["data"]["report"]["sessions"], 1);
    }

    fn register_agent(
        hub: &Hub,
        agent_id: &str,
        agent_type: &str,
        capability: &str,
    ) -> (String, mpsc::UnboundedReceiver<Outbound>) {
        let (session, mut rx) = hub.connect().unwrap();
        hub.handle_text(
            &session,
            &frame(
                "agent_register",
                json!({
                    "agent_id": agent_id,
                    "agent_type": agent_type,
                    "capabilities": [capability],
                    "max_concurrent": 1
                }),
            ),
        );
        assert_eq!(next(&mut rx)["type"], "registration_confirmed");
        (session, rx)
    }

    fn report(kind: &str, data: Value, request_id: &str) -> String {
        json!({
            "type": kind,
            "data": data,
            "timestamp": "2025-01-01T00:00:00Z",
            "request_id": request_id
        })
        .to_string()
    }

    #[test]
    fn test_reports_only_count_from_the_bound_agent() {
        let hub = hub();
        let (_lit, mut lit_rx) = register_agent(&hub, "lit-1", "literature_search", "literature_search");
        let (writer, mut writer_rx) = register_agent(&hub, "w-1", "writer", "write_report");
        let (client, mut client_rx) = hub.connect().unwrap();

        let task_id = hub
            .dispatcher()
            .submit(TaskRequest::new("literature_search", "search", json!({})))
            .unwrap();
        hub.dispatcher().run_pending(Instant::now());
        let submit = next(&mut lit_rx);
        assert_eq!(submit["type"], "task_submit");
        let request_id = submit["request_id"].as_str().unwrap().to_string();
        let result = json!({ "task_id": task_id, "agent_id": "lit-1", "status": "completed" });

        hub.handle_text(&client, &report("task_result", result.clone(), &request_id));
        assert_eq!(next(&mut client_rx)["data"]["error"]["code"], "UNKNOWN_AGENT");

        hub.handle_text(&writer, &report("task_result", result, &request_id));
        assert_eq!(next(&mut writer_rx)["data"]["error"]["code"], "UNKNOWN_AGENT");

        let accepted = json!({ "task_id": task_id, "agent_id": "lit-1", "status": "running" });
        hub.handle_text(&writer, &report("task_accepted", accepted, &request_id));
        assert_eq!(next(&mut writer_rx)["data"]["error"]["code"], "UNKNOWN_AGENT");

        hub.handle_text(&client, &report("heartbeat", json!({ "agent_id": "lit-1" }), "hb-1"));
        assert_eq!(next(&mut client_rx)["data"]["error"]["code"], "UNKNOWN_AGENT");

        assert_eq!(
            hub.dispatcher().task(&task_id).unwrap().status,
            TaskStatus::Dispatched
        );
    }

    #[test]
    fn test_task_result_must_echo_request_id() {
        let hub = hub();
        let (session, mut rx) =
            register_agent(&hub, "lit-1", "literature_search", "literature_search");
        let task_id = hub
            .dispatcher()
            .submit(TaskRequest::new("literature_search", "search", json!({})))
            .unwrap();
        hub.dispatcher().run_pending(Instant::now());
        let request_id = next(&mut rx)["request_id"].as_str().unwrap().to_string();

        let data = json!({ "task_id": task_id, "status": "completed" });
        hub.handle_text(&session, &frame("task_result", data.clone()));
        assert_eq!(next(&mut rx)["data"]["error"]["code"], "PROTOCOL_ERROR");
        assert_eq!(
            hub.dispatcher().task(&task_id).unwrap().status,
            TaskStatus::Dispatched
        );

        hub.handle_text(&session, &report("task_result", data, &request_id));
        assert_eq!(
            hub.dispatcher().task(&task_id).unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_disconnect_evicts_agent() {
        let hub = hub();
        let (session, _rx) = hub.connect().unwrap();
        hub.handle_text(
            &session,
            &frame(
                "agent_register",
                json!({
                    "agent_id": "lit-1",
                    "agent_type": "literature_search",
                    "capabilities": ["literature_search"]
                }),
            ),
        );
        assert_eq!(hub.registry().len(), 1);
        hub.disconnect(&session);
        assert!(hub.registry().is_empty());
        assert!(hub.sessions().is_empty());
    }
}
