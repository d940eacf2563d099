use crate::dispatch::{DispatchOutcome, Dispatcher, TaskRequest, TaskSnapshot, TaskTransport};
use crate::memory::{ContextManager, ContextStatus, SessionContext, TraceInput};
use crate::protocol::{AgentResponse, Envelope, Message};
use crate::types::{AppError, Result};
use crate::utils::toml_config::{HubConfigManager, StageConfig};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Stage task owned by the coordinator.
#[derive(Debug, Clone)]
struct StageTask {
    context_id: String,
    stage_index: usize,
    origin: Option<String>,
}

/// Context state plus the stage task currently running for it.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResearchStatus {
    pub context: SessionContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_task: Option<TaskSnapshot>,
}

pub struct ResearchCoordinator {
    config: Arc<HubConfigManager>,
    contexts: Arc<ContextManager>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn TaskTransport>,
    stage_tasks: DashMap<String, StageTask>,
    /// Serializes context transitions against outcome handling.
    transitions: Mutex<()>,
}

impl ResearchCoordinator {
    pub fn new(
        config: Arc<HubConfigManager>,
        contexts: Arc<ContextManager>,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn TaskTransport>,
    ) -> Self {
        Self {
            config,
            contexts,
            dispatcher,
            transport,
            stage_tasks: DashMap::new(),
            transitions: Mutex::new(()),
        }
    }

    /// Open a context for `query` and dispatch its first stage.
    pub fn start(
        &self,
        query: &str,
        seed_id: Option<&str>,
        origin: Option<&str>,
    ) -> Result<SessionContext> {
        if query.trim().is_empty() {
            return Err(AppError::InvalidInput("research query must not be empty".into()));
        }
        let config = self.config.config();
        let first = config
            .pipeline
            .stages
            .first()
            .ok_or_else(|| AppError::Configuration("pipeline has no stages".into()))?;

        let _guard = self.transitions.lock();
        let context = self
            .contexts
            .create_context_with(seed_id, json!({ "query": query, "origin": origin }))?;
        let context_id = context.context_id.clone();
        self.contexts
            .update_context_status(&context_id, ContextStatus::Active, Some(&first.name))?;
        self.contexts.add_context_trace(
            &context_id,
            TraceInput::new("request", json!({ "event": "research_requested", "query": query })),
        )?;

        info!(context_id = %context_id, stage = %first.name, "Research started");
        if let Err(e) = self.submit_stage(&context_id, 0, first, json!({ "query": query }), origin) {
            self.fail_stage(&context_id, &first.name, &e)?;
            return Err(e);
        }
        self.contexts.get_context(&context_id)
    }

    /// Reactivate a paused or failed context at its current stage, feeding it
    /// the last completed stage's output. Earlier stages are not replayed.
    ///
    /// A resume whose stage cannot be submitted leaves the context failed at
    /// that stage, so it can be resumed again.
    pub fn resume(&self, context_id: &str, origin: Option<&str>) -> Result<SessionContext> {
        let _guard = self.transitions.lock();
        let config = self.config.config();
        let context = self.contexts.get_context(context_id)?;
        let stage_name = context
            .current_stage
            .clone()
            .or_else(|| config.pipeline.stages.first().map(|s| s.name.clone()))
            .ok_or_else(|| AppError::Configuration("pipeline has no stages".into()))?;
        let (index, stage) = config.pipeline.stage(&stage_name).ok_or_else(|| {
            AppError::InvalidInput(format!(
                "context {} is at unknown stage '{}'",
                context_id, stage_name
            ))
        })?;

        let input = match index.checked_sub(1) {
            None => json!({ "query": context.metadata.get("query").cloned().unwrap_or(Value::Null) }),
            Some(previous) => self.stage_output(context_id, &config.pipeline.stages[previous].name)?,
        };

        self.contexts.resume_context(context_id)?;
        info!(context_id = %context_id, stage = %stage.name, "Research resumed");
        if let Err(e) = self.submit_stage(context_id, index, stage, input, origin) {
            self.fail_stage(context_id, &stage.name, &e)?;
            return Err(e);
        }
        self.contexts.get_context(context_id)
    }

    /// Pause the context and cancel its running stage task. A stage that
    /// finished before it could be cancelled still counts: the context stays
    /// paused at the following stage.
    pub fn pause(&self, context_id: &str) -> Result<SessionContext> {
        let _guard = self.transitions.lock();
        let context = self.contexts.get_context(context_id)?;
        if context.status != ContextStatus::Active {
            return Err(AppError::InvalidTransition(format!(
                "cannot pause context {} from {}",
                context_id, context.status
            )));
        }
        self.contexts
            .update_context_status(context_id, ContextStatus::Paused, None)?;

        // Detached first so a late outcome cannot pause a resumed context
        for task_id in self.tasks_of(context_id) {
            let Some((_, owned)) = self.stage_tasks.remove(&task_id) else {
                continue;
            };
            if let Err(e) = self.dispatcher.cancel_task(&task_id, "context paused", true) {
                debug!(task_id = %task_id, error = %e, "Stage task already finished");
                if let Some(outcome) = self.dispatcher.outcome(&task_id) {
                    self.apply_outcome(owned, &outcome)?;
                }
            }
        }
        info!(context_id = %context_id, "Research paused");
        self.contexts.get_context(context_id)
    }

    pub fn status(&self, context_id: &str) -> Result<ResearchStatus> {
        let context = self.contexts.get_context(context_id)?;
        let active_task = self
            .tasks_of(context_id)
            .into_iter()
            .filter_map(|id| self.dispatcher.task(&id))
            .find(|t| !t.status.is_terminal());
        Ok(ResearchStatus {
            context,
            active_task,
        })
    }

    fn tasks_of(&self, context_id: &str) -> Vec<String> {
        self.stage_tasks
            .iter()
            .filter(|t| t.context_id == context_id)
            .map(|t| t.key().clone())
            .collect()
    }

    fn submit_stage(
        &self,
        context_id: &str,
        index: usize,
        stage: &StageConfig,
        input: Value,
        origin: Option<&str>,
    ) -> Result<String> {
        let mut request = TaskRequest::new(
            stage.capability.clone(),
            stage.name.clone(),
            json!({ "context_id": context_id, "stage": stage.name, "input": input }),
        )
        .with_context(context_id)
        .with_stage(stage.name.clone())
        .with_priority(self.config.config().pipeline.stage_priority);
        if let Some(agent_type) = stage.agent_type {
            request = request.with_agent_type(agent_type);
        }
        if let Some(origin) = origin {
            request = request.with_origin(origin);
        }

        let task_id = self.dispatcher.submit(request)?;
        self.stage_tasks.insert(
            task_id.clone(),
            StageTask {
                context_id: context_id.to_string(),
                stage_index: index,
                origin: origin.map(str::to_string),
            },
        );
        debug!(context_id = %context_id, stage = %stage.name, task_id = %task_id, "Stage submitted");
        Ok(task_id)
    }

    /// Output recorded by the last completed task of `stage`.
    fn stage_output(&self, context_id: &str, stage: &str) -> Result<Value> {
        let traces = self.contexts.get_context_traces(context_id)?;
        Ok(traces
            .iter()
            .rev()
            .find(|t| t.stage == stage && t.content.get("event") == Some(&json!("completed")))
            .and_then(|t| t.content.get("result").cloned())
            .unwrap_or(Value::Null))
    }

    /// Advance, fail or pause a context after one of its stage tasks ends.
    pub fn on_outcome(&self, outcome: &DispatchOutcome) -> Result<()> {
        let _guard = self.transitions.lock();
        let Some((_, owned)) = self.stage_tasks.remove(&outcome.task_id) else {
            return Ok(());
        };
        self.apply_outcome(owned, outcome)
    }

    /// Settle every stage task whose outcome was missed on the feed. Tasks
    /// already pruned by the dispatcher fail their stage. Returns how many
    /// stage tasks were settled.
    pub fn reconcile(&self) -> Result<usize> {
        let _guard = self.transitions.lock();
        let owned: Vec<String> = self.stage_tasks.iter().map(|t| t.key().clone()).collect();
        let mut settled = 0;
        for task_id in owned {
            let outcome = self.dispatcher.outcome(&task_id);
            let missing = outcome.is_none() && self.dispatcher.task(&task_id).is_none();
            if outcome.is_none() && !missing {
                continue;
            }
            let Some((_, stage_task)) = self.stage_tasks.remove(&task_id) else {
                continue;
            };
            settled += 1;
            match outcome {
                Some(outcome) => self.apply_outcome(stage_task, &outcome)?,
                None => {
                    let stage = self.stage_name(stage_task.stage_index);
                    self.fail_stage(
                        &stage_task.context_id,
                        &stage,
                        &AppError::TaskNotFound(task_id),
                    )?;
                }
            }
        }
        Ok(settled)
    }

    fn stage_name(&self, index: usize) -> String {
        self.config
            .config()
            .pipeline
            .stages
            .get(index)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "dispatch".to_string())
    }

    /// Record a stage that could not run and leave the context resumable there.
    fn fail_stage(&self, context_id: &str, stage: &str, error: &AppError) -> Result<()> {
        warn!(context_id = %context_id, stage = %stage, code = error.code(), error = %error, "Stage submission failed");
        self.contexts.add_context_trace(
            context_id,
            TraceInput::new(
                stage,
                json!({ "event": "failed", "code": error.code(), "error": error.to_string() }),
            ),
        )?;
        self.contexts
            .update_context_status(context_id, ContextStatus::Failed, Some(stage))?;
        Ok(())
    }

    fn apply_outcome(&self, owned: StageTask, outcome: &DispatchOutcome) -> Result<()> {
        let config = self.config.config();
        let stages = &config.pipeline.stages;
        let context_id = owned.context_id.as_str();
        let stage_name = stages
            .get(owned.stage_index)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "dispatch".to_string());

        if outcome.cancelled {
            let context = self.contexts.get_context(context_id)?;
            if context.status == ContextStatus::Active {
                self.contexts
                    .update_context_status(context_id, ContextStatus::Paused, Some(&stage_name))?;
            }
            return Ok(());
        }

        if !outcome.succeeded() {
            warn!(
                context_id = %context_id,
                stage = %stage_name,
                code = outcome.error.as_ref().map(|e| e.code()).unwrap_or("UNKNOWN"),
                "Research stage failed"
            );
            self.contexts
                .update_context_status(context_id, ContextStatus::Failed, Some(&stage_name))?;
            return Ok(());
        }

        let context = self.contexts.get_context(context_id)?;
        if !matches!(context.status, ContextStatus::Active | ContextStatus::Paused) {
            debug!(context_id = %context_id, status = %context.status, "Ignoring outcome for settled context");
            return Ok(());
        }

        let next_index = owned.stage_index + 1;
        let Some(next) = stages.get(next_index) else {
            return self.finish(context_id, &stage_name, outcome, owned.origin.as_deref());
        };

        if context.status == ContextStatus::Paused {
            // Keep the finished stage; resume picks up at the next one
            self.contexts
                .update_context_status(context_id, ContextStatus::Paused, Some(&next.name))?;
            debug!(context_id = %context_id, stage = %next.name, "Paused context advanced");
            return Ok(());
        }

        self.contexts
            .update_context_status(context_id, ContextStatus::Active, Some(&next.name))?;
        info!(context_id = %context_id, stage = %next.name, "Research advanced");
        if let Err(e) = self.submit_stage(
            context_id,
            next_index,
            next,
            outcome.result.clone(),
            owned.origin.as_deref(),
        ) {
            self.fail_stage(context_id, &next.name, &e)?;
        }
        Ok(())
    }

    fn finish(
        &self,
        context_id: &str,
        stage_name: &str,
        outcome: &DispatchOutcome,
        origin: Option<&str>,
    ) -> Result<()> {
        self.contexts.add_context_trace(
            context_id,
            TraceInput::new(
                stage_name,
                json!({ "event": "research_completed", "result": outcome.result }),
            ),
        )?;
        self.contexts
            .update_context_status(context_id, ContextStatus::Completed, None)?;
        info!(context_id = %context_id, "Research completed");

        if let Some(session_id) = origin {
            let response = AgentResponse::ok(
                context_id,
                json!({
                    "event": "research_completed",
                    "context_id": context_id,
                    "result": outcome.result,
                }),
            );
            if let Err(e) = self
                .transport
                .deliver_to_session(session_id, Envelope::new(Message::AgentResponse(response)))
            {
                debug!(context_id = %context_id, error = %e, "Originator gone, completion dropped");
            }
        }
        Ok(())
    }

    /// Drive contexts from the dispatcher's outcome feed.
    pub fn start_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut outcomes = self.dispatcher.subscribe();

        tokio::spawn(async move {
            loop {
                match outcomes.recv().await {
                    Ok(outcome) => {
                        if let Err(e) = coordinator.on_outcome(&outcome) {
                            warn!(task_id = %outcome.task_id, error = %e, "Pipeline update failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pipeline driver lagged behind task outcomes");
                        match coordinator.reconcile() {
                            Ok(settled) => info!(settled, "Reconciled stage tasks after lag"),
                            Err(e) => warn!(error = %e, "Reconciliation failed"),
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
