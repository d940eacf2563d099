//! Shared fixtures for hub integration tests.

#![allow(dead_code)]

use ares_mcp::{
    agents::{AgentRegistration, AgentRegistry},
    dispatch::{CircuitBreakerRegistry, Dispatcher, TaskTransport},
    memory::ContextManager,
    protocol::{Envelope, Message, TaskResult, TaskSubmit},
    types::{AgentType, AppError, Result, TaskStatus},
    HubConfig, HubConfigManager,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Transport that records every frame instead of writing to a socket.
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<(String, Envelope)>>,
    unreachable: Mutex<Vec<String>>,
}

impl TaskTransport for RecordingTransport {
    fn deliver_to_agent(&self, agent_id: &str, envelope: Envelope) -> Result<()> {
        if self.unreachable.lock().iter().any(|a| a == agent_id) {
            return Err(AppError::SessionNotFound(agent_id.to_string()));
        }
        self.frames.lock().push((agent_id.to_string(), envelope));
        Ok(())
    }

    fn deliver_to_session(&self, session_id: &str, envelope: Envelope) -> Result<()> {
        self.frames
            .lock()
            .push((format!("session:{}", session_id), envelope));
        Ok(())
    }
}

impl RecordingTransport {
    /// Make deliveries to `agent_id` fail.
    pub fn cut(&self, agent_id: &str) {
        self.unreachable.lock().push(agent_id.to_string());
    }

    pub fn restore(&self, agent_id: &str) {
        self.unreachable.lock().retain(|a| a != agent_id);
    }

    pub fn sent_to(&self, target: &str) -> Vec<Envelope> {
        self.frames
            .lock()
            .iter()
            .filter(|(to, _)| to == target)
            .map(|(_, env)| env.clone())
            .collect()
    }

    pub fn count(&self, target: &str, kind: &str) -> usize {
        self.sent_to(target)
            .iter()
            .filter(|env| env.kind() == kind)
            .count()
    }

    /// Task submissions delivered to `agent_id`, oldest first.
    pub fn submits_to(&self, agent_id: &str) -> Vec<TaskSubmit> {
        self.sent_to(agent_id)
            .into_iter()
            .filter_map(|env| match env.message {
                Message::TaskSubmit(submit) => Some(submit),
                _ => None,
            })
            .collect()
    }

    /// Request ids of every `task_submit` for `task_id` sent to `agent_id`,
    /// one per attempt.
    pub fn request_ids(&self, agent_id: &str, task_id: &str) -> Vec<String> {
        self.sent_to(agent_id)
            .into_iter()
            .filter(|env| {
                matches!(&env.message, Message::TaskSubmit(submit)
                    if submit.task_id.as_deref() == Some(task_id))
            })
            .filter_map(|env| env.request_id)
            .collect()
    }

    /// `task_result` frames sent back to an originating session.
    pub fn results_to_session(&self, session_id: &str) -> Vec<TaskResult> {
        self.sent_to(&format!("session:{}", session_id))
            .into_iter()
            .filter_map(|env| match env.message {
                Message::TaskResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}

pub struct Harness {
    pub config: Arc<HubConfigManager>,
    pub registry: Arc<AgentRegistry>,
    pub contexts: Arc<ContextManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub transport: Arc<RecordingTransport>,
}

pub fn harness(config: HubConfig) -> Harness {
    let config = Arc::new(HubConfigManager::from_config(config));
    let registry = Arc::new(AgentRegistry::new(
        Arc::clone(&config),
        Arc::new(CircuitBreakerRegistry::new()),
    ));
    let contexts = Arc::new(ContextManager::new());
    let transport = Arc::new(RecordingTransport::default());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&config),
        Arc::clone(&registry),
        Arc::clone(&contexts),
        transport.clone(),
    ));
    Harness {
        config,
        registry,
        contexts,
        dispatcher,
        transport,
    }
}

pub fn register(harness: &Harness, agent_id: &str, capability: &str, max_concurrency: u32) {
    harness
        .registry
        .register(AgentRegistration::new(
            agent_id,
            AgentType::LiteratureSearch,
            [capability],
            max_concurrency,
        ))
        .unwrap();
}

pub fn completed(task_id: &str, agent_id: &str, result: Value) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        agent_id: Some(agent_id.to_string()),
        status: TaskStatus::Completed,
        result,
        error: None,
        reason_code: None,
    }
}

pub fn failed(task_id: &str, agent_id: &str, error: &str) -> TaskResult {
    TaskResult {
        task_id: task_id.to_string(),
        agent_id: Some(agent_id.to_string()),
        status: TaskStatus::Failed,
        result: Value::Null,
        error: Some(error.to_string()),
        reason_code: None,
    }
}
