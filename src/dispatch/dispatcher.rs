//! Task dispatcher
//!
//! A pool of workers pulls submitted tasks in priority order (FIFO within a
//! priority), asks the registry for routable agents with a free slot, picks
//! one with the configured [`LoadBalanceStrategy`](super::LoadBalanceStrategy)
//! and forwards the task.
//!
//! Tasks with no eligible agent are parked. Parked tasks are retried whenever
//! the registry changes and on every watch tick, until their wait bound
//! expires. A separate watcher enforces per-attempt deadlines regardless of
//! what the agent does.
//!
//! Every attempt failure (delivery error, reported failure, timeout,
//! disconnect) counts against the agent's circuit breaker and is retried on a
//! different agent where possible, up to `retry_attempts` retries. Each task
//! reaches exactly one terminal state, which is traced, reported to the
//! originating session and published on the outcome feed.

use super::balancer::LoadBalancer;
use super::task::{DispatchOutcome, Task, TaskRequest, TaskSnapshot};
use super::{CircuitState, TaskTransport};
use crate::agents::{AgentRegistry, AgentSnapshot};
use crate::memory::{ContextManager, ContextStatus, TraceInput};
use crate::protocol::{Envelope, Message, ResearchAction, TaskResult, TaskSubmit};
use crate::types::{AppError, HealthStatus, Result, TaskStatus};
use crate::utils::toml_config::{HubConfig, HubConfigManager};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;


#[derive(Debug, Clone, PartialEq, Eq)]
struct Queued {
    priority: u8,
    seq: u64,
    task_id: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Queues {
    ready: BinaryHeap<Queued>,
    parked: Vec<Queued>,
}

/// In-flight attempt detached from its task under the task's lock.
#[derive(Debug)]
struct Attempt {
    agent_id: String,
    trial: bool,
    dispatched_at: Option<Instant>,
}

/// Whether a report addressed to the current attempt: the agent must be the
/// assignee and an echoed request id must be the one sent with this attempt.
fn owns_attempt(task: &Task, agent_id: Option<&str>, request_id: Option<&str>) -> bool {
    agent_id.is_none_or(|a| task.assigned_agent.as_deref() == Some(a))
        && request_id.is_none_or(|r| task.request_id.as_deref() == Some(r))
}

fn claim_attempt(
    task: &mut Task,
    expected_agent: Option<&str>,
    expected_request: Option<&str>,
) -> Option<Attempt> {
    if !task.is_in_flight() || !owns_attempt(task, expected_agent, expected_request) {
        return None;
    }
    let assigned = task.assigned_agent.clone()?;
    task.attempt_deadline = None;
    Some(Attempt {
        agent_id: assigned,
        trial: std::mem::take(&mut task.trial),
        dispatched_at: task.dispatched_at.take(),
    })
}

enum AfterFailure {
    Retry(Queued),
    Exhausted(DispatchOutcome),
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    retried: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DispatchStats {
    /// Tasks waiting for an agent
    pub queued: usize,
    /// Tasks dispatched or running
    pub in_flight: usize,
    pub submitted_total: u64,
    pub dispatched_total: u64,
    pub retried_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub cancelled_total: u64,
}

pub struct Dispatcher {
    config: Arc<HubConfigManager>,
    registry: Arc<AgentRegistry>,
    contexts: Arc<ContextManager>,
    transport: Arc<dyn TaskTransport>,
    balancer: LoadBalancer,
    tasks: DashMap<String, Task>,
    queues: Mutex<Queues>,
    ready_notify: Notify,
    seq: AtomicU64,
    outcomes: broadcast::Sender<DispatchOutcome>,
    counters: Counters,
    shutdown: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: Arc<HubConfigManager>,
        registry: Arc<AgentRegistry>,
        contexts: Arc<ContextManager>,
        transport: Arc<dyn TaskTransport>,
    ) -> Self {
        let capacity = config.config().dispatch.outcome_buffer.max(1);
        let (outcomes, _) = broadcast::channel(capacity);
        Self {
            config,
            registry,
            contexts,
            transport,
            balancer: LoadBalancer::new(),
            tasks: DashMap::new(),
            queues: Mutex::new(Queues::default()),
            ready_notify: Notify::new(),
            seq: AtomicU64::new(0),
            outcomes,
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Terminal outcomes, one per task.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchOutcome> {
        self.outcomes.subscribe()
    }

    // ============= Submission =============

    /// Accept a task for routing and return its id.
    pub fn submit(&self, request: TaskRequest) -> Result<String> {
        if request.capability.trim().is_empty() {
            return Err(AppError::InvalidInput("task capability must not be empty".into()));
        }
        if let Some(context_id) = &request.context_id {
            let context = self.contexts.get_context(context_id)?;
            if context.status == ContextStatus::Completed {
                return Err(AppError::InvalidTransition(format!(
                    "context {} is completed",
                    context_id
                )));
            }
        }

        let capacity = self.config.config().dispatch.backlog_capacity;
        if self.pending_count() >= capacity {
            return Err(AppError::BacklogFull(format!(
                "{} tasks already waiting",
                capacity
            )));
        }

        let task_id = request
            .task_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let queued = Queued {
            priority: request.priority,
            seq,
            task_id: task_id.clone(),
        };

        match self.tasks.entry(task_id.clone()) {
            Entry::Occupied(_) => {
                return Err(AppError::InvalidInput(format!(
                    "task {} already exists",
                    task_id
                )))
            }
            Entry::Vacant(vacant) => {
                info!(
                    task_id = %task_id,
                    capability = %request.capability,
                    priority = request.priority,
                    "Task submitted"
                );
                vacant.insert(Task::new(task_id.clone(), request, seq));
            }
        }

        self.counters.submitted.fetch_add(1, AtomicOrdering::Relaxed);
        self.enqueue(queued);
        Ok(task_id)
    }

    fn enqueue(&self, queued: Queued) {
        self.queues.lock().ready.push(queued);
        self.ready_notify.notify_one();
    }

    fn pending_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Submitted)
            .count()
    }

    // ============= Dispatch =============

    /// Worker loop: dispatch ready tasks until shutdown.
    pub async fn dispatch_loop(self: Arc<Self>, worker: usize) {
        debug!(worker, "Dispatch worker started");
        loop {
            if self.shutdown.load(AtomicOrdering::Relaxed) {
                break;
            }
            let next = self.queues.lock().ready.pop();
            match next {
                Some(queued) => self.try_dispatch(queued, Instant::now()),
                None => self.ready_notify.notified().await,
            }
        }
        debug!(worker, "Dispatch worker stopped");
    }

    /// Dispatch everything currently ready on the calling thread.
    pub fn run_pending(&self, now: Instant) -> usize {
        let mut handled = 0;
        loop {
            let next = self.queues.lock().ready.pop();
            let Some(queued) = next else { break };
            self.try_dispatch(queued, now);
            handled += 1;
        }
        handled
    }

    fn try_dispatch(&self, queued: Queued, now: Instant) {
        let cfg = self.config.config();
        let snapshot = self.tasks.get(&queued.task_id).and_then(|t| {
            (t.status == TaskStatus::Submitted && !t.cancelled).then(|| {
                (
                    t.request.clone(),
                    t.failed_agents.clone(),
                    t.backlog_deadline,
                )
            })
        });
        let Some((request, failed_agents, backlog_deadline)) = snapshot else {
            return;
        };

        if backlog_deadline.is_some_and(|deadline| now >= deadline) {
            self.expire_backlog(&queued.task_id, now);
            return;
        }

        let mut candidates: Vec<AgentSnapshot> = self
            .registry
            .query_at(&request.capability, now)
            .into_iter()
            .filter(|a| request.agent_type.is_none_or(|t| a.agent_type == t))
            .filter(AgentSnapshot::has_capacity)
            .collect();

        // Agents that already failed this task are a last resort
        let fresh: Vec<AgentSnapshot> = candidates
            .iter()
            .filter(|a| !failed_agents.contains(&a.agent_id))
            .cloned()
            .collect();
        if !fresh.is_empty() {
            candidates = fresh;
        }

        let breakers = self.registry.breakers();
        while !candidates.is_empty() {
            let Some(chosen) = self
                .balancer
                .select(
                    cfg.dispatch.strategy,
                    &request.capability,
                    &candidates,
                    cfg.dispatch.latency_weight,
                )
                .map(|a| a.agent_id.clone())
            else {
                break;
            };

            let trial = cfg.circuit_breaker.enabled
                && breakers.state(&chosen, now) == CircuitState::HalfOpen;
            if breakers.try_acquire(&chosen, now, &cfg.circuit_breaker) {
                if self.registry.acquire_slot(&chosen).is_ok() {
                    self.start_attempt(&queued, &chosen, trial, now);
                    return;
                }
                if trial {
                    breakers.release_trial(&chosen);
                }
            }
            candidates.retain(|a| a.agent_id != chosen);
        }

        self.park(queued, &request, now);
    }

    fn park(&self, queued: Queued, request: &TaskRequest, now: Instant) {
        let wait = request
            .timeout
            .unwrap_or_else(|| self.config.config().dispatch.task_timeout());
        let waiting = match self.tasks.get_mut(&queued.task_id) {
            Some(mut task) if task.status == TaskStatus::Submitted && !task.cancelled => {
                task.backlog_deadline.get_or_insert(now + wait);
                true
            }
            _ => false,
        };

        if waiting {
            debug!(
                task_id = %queued.task_id,
                capability = %request.capability,
                "No eligible agent, task parked"
            );
            self.queues.lock().parked.push(queued);
        }
    }

    /// Move parked tasks back to the ready queue.
    pub fn unpark_all(&self) -> usize {
        let moved = {
            let mut queues = self.queues.lock();
            let parked = std::mem::take(&mut queues.parked);
            let moved = parked.len();
            queues.ready.extend(parked);
            moved
        };
        if moved > 0 {
            self.ready_notify.notify_one();
        }
        moved
    }

    fn start_attempt(&self, queued: &Queued, agent_id: &str, trial: bool, now: Instant) {
        let default_timeout = self.config.config().dispatch.task_timeout();
        let agent_timeout = self.registry.task_timeout(agent_id);
        let request_id = Uuid::new_v4().to_string();

        let prepared = match self.tasks.get_mut(&queued.task_id) {
            Some(mut task) if task.status == TaskStatus::Submitted && !task.cancelled => {
                let timeout = task
                    .request
                    .timeout
                    .or(agent_timeout)
                    .unwrap_or(default_timeout);
                task.status = TaskStatus::Dispatched;
                task.attempt += 1;
                task.assigned_agent = Some(agent_id.to_string());
                task.trial = trial;
                task.request_id = Some(request_id.clone());
                task.dispatched_at = Some(now);
                task.attempt_deadline = Some(now + timeout);
                task.backlog_deadline = None;
                task.updated_at = Utc::now();
                Some((task.attempt, timeout, task.request.clone(), task.stage_label()))
            }
            _ => None,
        };

        let Some((attempt, timeout, request, stage)) = prepared else {
            self.registry.release_slot(agent_id);
            if trial {
                self.registry.breakers().release_trial(agent_id);
            }
            return;
        };

        self.counters.dispatched.fetch_add(1, AtomicOrdering::Relaxed);
        info!(
            task_id = %queued.task_id,
            agent_id = %agent_id,
            attempt,
            "Task dispatched"
        );
        self.trace(
            request.context_id.as_deref(),
            TraceInput::new(
                stage,
                json!({ "event": "dispatched", "agent_id": agent_id, "attempt": attempt }),
            )
            .with_task(queued.task_id.clone()),
        );

        let envelope = Envelope::new(Message::TaskSubmit(TaskSubmit {
            task_id: Some(queued.task_id.clone()),
            context_id: request.context_id.clone(),
            agent_type: request.agent_type.map(|t| t.to_string()),
            capability: Some(request.capability.clone()),
            action: request.action.clone(),
            payload: request.payload.clone(),
            priority: Some(request.priority),
            timeout: Some(timeout.as_secs()),
            stage: request.stage.clone(),
            attempt: Some(attempt),
        }))
        .with_request_id(request_id);

        if let Err(e) = self.transport.deliver_to_agent(agent_id, envelope) {
            warn!(task_id = %queued.task_id, agent_id = %agent_id, error = %e, "Task delivery failed");
            self.fail_attempt(
                &queued.task_id,
                Some(agent_id),
                None,
                AppError::Internal(format!("delivery to agent {} failed: {}", agent_id, e)),
                now,
            );
        }
    }

    // ============= Agent Reports =============

    /// Agent acknowledged the task. `request_id`, when given, must be the
    /// one sent with the current attempt.
    pub fn mark_running(
        &self,
        task_id: &str,
        agent_id: &str,
        request_id: Option<&str>,
    ) -> Result<()> {
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
        if task.status == TaskStatus::Dispatched
            && owns_attempt(&task, Some(agent_id), request_id)
        {
            task.status = TaskStatus::Running;
            task.updated_at = Utc::now();
            debug!(task_id = %task_id, agent_id = %agent_id, "Task running");
        }
        Ok(())
    }

    /// Apply a `task_result` from `agent_id`. Returns whether it changed the
    /// task; stale reports from earlier attempts are ignored.
    ///
    /// `request_id` is the id echoed from the dispatch envelope. A report
    /// carrying another attempt's id never touches the current attempt, even
    /// when the retry landed on the same agent.
    pub fn on_task_result(
        &self,
        agent_id: &str,
        request_id: Option<&str>,
        report: &TaskResult,
        now: Instant,
    ) -> Result<bool> {
        if !self.tasks.contains_key(&report.task_id) {
            return Err(AppError::TaskNotFound(report.task_id.clone()));
        }

        match report.status {
            TaskStatus::Completed => Ok(self.complete(agent_id, request_id, report, now)),
            TaskStatus::Failed => {
                let reason = report
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified failure".to_string());
                Ok(self.fail_attempt(
                    &report.task_id,
                    Some(agent_id),
                    request_id,
                    AppError::Internal(format!("agent {} reported failure: {}", agent_id, reason)),
                    now,
                ))
            }
            TaskStatus::TimedOut => Ok(self.fail_attempt(
                &report.task_id,
                Some(agent_id),
                request_id,
                AppError::DispatchTimeout(format!(
                    "agent {} reported timeout for task {}",
                    agent_id, report.task_id
                )),
                now,
            )),
            TaskStatus::Submitted | TaskStatus::Dispatched | TaskStatus::Running => {
                self.mark_running(&report.task_id, agent_id, request_id)?;
                Ok(false)
            }
        }
    }

    fn complete(
        &self,
        agent_id: &str,
        request_id: Option<&str>,
        report: &TaskResult,
        now: Instant,
    ) -> bool {
        let claimed = match self.tasks.get_mut(&report.task_id) {
            Some(mut task) => claim_attempt(&mut task, Some(agent_id), request_id).map(|attempt| {
                task.status = TaskStatus::Completed;
                task.result = Some(report.result.clone());
                task.last_error = None;
                task.finished_at = Some(now);
                task.updated_at = Utc::now();
                (attempt, outcome_of(&task))
            }),
            None => None,
        };
        let Some((attempt, outcome)) = claimed else {
            debug!(task_id = %report.task_id, agent_id = %agent_id, "Ignoring stale result");
            return false;
        };

        self.registry.release_slot(&attempt.agent_id);
        if let Some(at) = attempt.dispatched_at {
            self.registry
                .record_latency(&attempt.agent_id, now.saturating_duration_since(at));
        }
        let cfg = self.config.config();
        if let Some(CircuitState::Closed) = self
            .registry
            .breakers()
            .record_success(&attempt.agent_id, &cfg.circuit_breaker)
        {
            info!(agent_id = %attempt.agent_id, "Circuit closed after successful trial");
        }

        self.publish(outcome, true);
        true
    }

    /// Fail the current attempt and retry or give up.
    fn fail_attempt(
        &self,
        task_id: &str,
        expected_agent: Option<&str>,
        expected_request: Option<&str>,
        error: AppError,
        now: Instant,
    ) -> bool {
        let cfg = self.config.config();
        let max_attempts = cfg.dispatch.max_attempts();

        let claimed = match self.tasks.get_mut(task_id) {
            Some(mut task) => claim_attempt(&mut task, expected_agent, expected_request).map(|attempt| {
                task.failed_agents.insert(attempt.agent_id.clone());
                task.updated_at = Utc::now();
                let next = if task.attempt < max_attempts {
                    task.status = TaskStatus::Submitted;
                    task.assigned_agent = None;
                    task.backlog_deadline = None;
                    task.last_error = Some(error.clone());
                    AfterFailure::Retry(Queued {
                        priority: task.request.priority,
                        seq: task.seq,
                        task_id: task.id.clone(),
                    })
                } else {
                    task.status = TaskStatus::Failed;
                    task.finished_at = Some(now);
                    task.last_error = Some(AppError::MaxRetriesExceeded {
                        task_id: task.id.clone(),
                        attempts: task.attempt,
                        reason: error.to_string(),
                    });
                    AfterFailure::Exhausted(outcome_of(&task))
                };
                (
                    attempt,
                    next,
                    task.attempt,
                    task.request.context_id.clone(),
                    task.stage_label(),
                )
            }),
            None => None,
        };
        let Some((attempt, next, attempt_no, context_id, stage)) = claimed else {
            return false;
        };

        self.registry.release_slot(&attempt.agent_id);
        if let Some(CircuitState::Open) =
            self.registry
                .breakers()
                .record_failure(&attempt.agent_id, now, &cfg.circuit_breaker)
        {
            warn!(agent_id = %attempt.agent_id, "Circuit opened");
        }

        let event = match error {
            AppError::DispatchTimeout(_) => "timed_out",
            _ => "attempt_failed",
        };
        self.trace(
            context_id.as_deref(),
            TraceInput::new(
                stage,
                json!({
                    "event": event,
                    "agent_id": attempt.agent_id,
                    "attempt": attempt_no,
                    "code": error.code(),
                    "error": error.to_string(),
                }),
            )
            .with_task(task_id),
        );

        match next {
            AfterFailure::Retry(queued) => {
                self.counters.retried.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    task_id = %task_id,
                    agent_id = %attempt.agent_id,
                    attempt = attempt_no,
                    reason = %error,
                    "Retrying task"
                );
                self.enqueue(queued);
            }
            AfterFailure::Exhausted(outcome) => self.publish(outcome, true),
        }
        true
    }

    /// Fail a parked task whose wait bound elapsed.
    fn expire_backlog(&self, task_id: &str, now: Instant) {
        let cfg = self.config.config();
        let outcome = match self.tasks.get_mut(task_id) {
            Some(mut task) if task.status == TaskStatus::Submitted && !task.cancelled => {
                let capability = task.request.capability.clone();
                let error = if self.all_blocked_by_breakers(&capability, now, &cfg) {
                    AppError::CircuitOpen(format!("every '{}' agent", capability))
                } else {
                    AppError::NoCapableAgent(capability)
                };
                task.status = TaskStatus::Failed;
                task.finished_at = Some(now);
                task.updated_at = Utc::now();
                task.last_error = Some(error);
                Some(outcome_of(&task))
            }
            _ => None,
        };
        if let Some(outcome) = outcome {
            self.publish(outcome, true);
        }
    }

    fn all_blocked_by_breakers(
        &self,
        capability: &str,
        now: Instant,
        cfg: &HubConfig,
    ) -> bool {
        if !cfg.circuit_breaker.enabled {
            return false;
        }
        let reachable: Vec<String> = self
            .registry
            .agents()
            .into_iter()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .filter(|a| a.health != HealthStatus::Unreachable)
            .map(|a| a.agent_id)
            .collect();
        !reachable.is_empty()
            && reachable.iter().all(|id| {
                !self
                    .registry
                    .breakers()
                    .is_available(id, now, &cfg.circuit_breaker)
            })
    }

    // ============= Cancellation =============

    /// Cancel a task; an in-flight attempt gets a best-effort notice and its
    /// slot back immediately.
    pub fn cancel_task(&self, task_id: &str, reason: &str, notify_origin: bool) -> Result<TaskSnapshot> {
        let now = Instant::now();
        let (attempt, outcome, snapshot) = {
            let mut task = self
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;
            if task.status.is_terminal() {
                return Err(AppError::InvalidTransition(format!(
                    "task {} already {}",
                    task_id,
                    task.status.as_str()
                )));
            }
            let attempt = claim_attempt(&mut task, None, None);
            task.status = TaskStatus::Failed;
            task.cancelled = true;
            task.finished_at = Some(now);
            task.updated_at = Utc::now();
            task.last_error = Some(AppError::Cancelled(reason.to_string()));
            (attempt, outcome_of(&task), task.snapshot())
        };

        if let Some(attempt) = attempt {
            self.registry.release_slot(&attempt.agent_id);
            if attempt.trial {
                self.registry.breakers().release_trial(&attempt.agent_id);
            }
            self.send_cancel_notice(task_id, &attempt.agent_id, reason);
        }

        self.publish(outcome, notify_origin);
        Ok(snapshot)
    }

    /// Cancel every unfinished task that `session_id` submitted.
    pub fn cancel_session_tasks(&self, session_id: &str) -> usize {
        let owned: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| t.request.origin_session.as_deref() == Some(session_id))
            .map(|t| t.id.clone())
            .collect();

        owned
            .iter()
            .filter(|id| self.cancel_task(id, "originator disconnected", false).is_ok())
            .count()
    }

    /// Fail the in-flight attempts of an agent that went away.
    pub fn on_agent_disconnected(&self, agent_id: &str, now: Instant) -> usize {
        let assigned: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.is_in_flight() && t.assigned_agent.as_deref() == Some(agent_id))
            .map(|t| t.id.clone())
            .collect();

        assigned
            .iter()
            .filter(|id| {
                self.fail_attempt(
                    id,
                    Some(agent_id),
                    None,
                    AppError::Internal(format!("agent {} disconnected", agent_id)),
                    now,
                )
            })
            .count()
    }

    fn send_cancel_notice(&self, task_id: &str, agent_id: &str, reason: &str) {
        let notice = Envelope::request(Message::ResearchAction(ResearchAction::cancel(
            task_id, reason,
        )));
        if let Err(e) = self.transport.deliver_to_agent(agent_id, notice) {
            debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Cancel notice not delivered");
        }
    }

    // ============= Timeouts =============

    /// Enforce attempt deadlines and backlog bounds, retry parked tasks and
    /// drop finished tasks past retention.
    pub fn check_timeouts(&self, now: Instant) {
        let expired: Vec<(String, String, Option<String>)> = self
            .tasks
            .iter()
            .filter(|t| t.is_in_flight())
            .filter(|t| t.attempt_deadline.is_some_and(|d| now >= d))
            .filter_map(|t| {
                t.assigned_agent
                    .clone()
                    .map(|a| (t.id.clone(), a, t.request_id.clone()))
            })
            .collect();

        for (task_id, agent_id, request_id) in expired {
            self.send_cancel_notice(&task_id, &agent_id, "timeout");
            self.fail_attempt(
                &task_id,
                Some(&agent_id),
                request_id.as_deref(),
                AppError::DispatchTimeout(format!(
                    "task {} on agent {} exceeded its deadline",
                    task_id, agent_id
                )),
                now,
            );
        }

        let overdue: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Submitted && !t.cancelled)
            .filter(|t| t.backlog_deadline.is_some_and(|d| now >= d))
            .map(|t| t.id.clone())
            .collect();
        for task_id in overdue {
            self.expire_backlog(&task_id, now);
        }

        self.unpark_all();
        self.prune(now);
    }

    fn prune(&self, now: Instant) {
        let retention = self.config.config().dispatch.result_retention();
        self.tasks.retain(|_, t| {
            !(t.status.is_terminal()
                && t
                    .finished_at
                    .is_some_and(|f| now.saturating_duration_since(f) >= retention))
        });
    }

    /// Watcher loop driving [`Dispatcher::check_timeouts`].
    pub async fn watch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.config().dispatch.watch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.shutdown.load(AtomicOrdering::Relaxed) {
                break;
            }
            self.check_timeouts(Instant::now());
        }
    }

    /// Retry parked tasks whenever the registry changes.
    pub async fn unpark_on_registry_change(self: Arc<Self>) {
        let mut changes = self.registry.subscribe();
        while changes.changed().await.is_ok() {
            if self.shutdown.load(AtomicOrdering::Relaxed) {
                break;
            }
            self.unpark_all();
        }
    }

    /// Spawn workers, the timeout watcher and the registry listener.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let workers = self.config.config().dispatch.workers;
        let mut handles: Vec<JoinHandle<()>> = (0..workers)
            .map(|worker| tokio::spawn(Arc::clone(self).dispatch_loop(worker)))
            .collect();
        handles.push(tokio::spawn(Arc::clone(self).watch_loop()));
        handles.push(tokio::spawn(Arc::clone(self).unpark_on_registry_change()));
        info!(workers, "Dispatcher started");
        handles
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, AtomicOrdering::Relaxed);
        self.ready_notify.notify_waiters();
    }

    // ============= Terminal Reporting =============

    fn publish(&self, outcome: DispatchOutcome, notify_origin: bool) {
        let stage = outcome
            .stage
            .clone()
            .unwrap_or_else(|| "dispatch".to_string());
        let content = match &outcome.error {
            None => json!({
                "event": "completed",
                "agent_id": outcome.agent_id,
                "attempts": outcome.attempts,
                "result": outcome.result,
            }),
            Some(err) => json!({
                "event": if outcome.cancelled { "cancelled" } else { "failed" },
                "agent_id": outcome.agent_id,
                "attempts": outcome.attempts,
                "code": err.code(),
                "error": err.to_string(),
            }),
        };
        self.trace(
            outcome.context_id.as_deref(),
            TraceInput::new(stage, content).with_task(outcome.task_id.clone()),
        );

        if notify_origin {
            if let Some(session_id) = &outcome.origin_session {
                let envelope = Envelope::new(Message::TaskResult(TaskResult {
                    task_id: outcome.task_id.clone(),
                    agent_id: outcome.agent_id.clone(),
                    status: outcome.status,
                    result: outcome.result.clone(),
                    error: outcome.error.as_ref().map(|e| e.to_string()),
                    reason_code: outcome.error.as_ref().map(|e| e.code().to_string()),
                }));
                if let Err(e) = self.transport.deliver_to_session(session_id, envelope) {
                    debug!(task_id = %outcome.task_id, error = %e, "Originator gone, result dropped");
                }
            }
        }

        match &outcome.error {
            None => {
                self.counters.completed.fetch_add(1, AtomicOrdering::Relaxed);
                info!(task_id = %outcome.task_id, attempts = outcome.attempts, "Task completed");
            }
            Some(err) if outcome.cancelled => {
                self.counters.cancelled.fetch_add(1, AtomicOrdering::Relaxed);
                info!(task_id = %outcome.task_id, reason = %err, "Task cancelled");
            }
            Some(err) => {
                self.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(task_id = %outcome.task_id, code = err.code(), error = %err, "Task failed");
            }
        }

        // No subscribers is fine
        let _ = self.outcomes.send(outcome);
    }

    fn trace(&self, context_id: Option<&str>, input: TraceInput) {
        let Some(context_id) = context_id else {
            return;
        };
        if let Err(e) = self.contexts.add_context_trace(context_id, input) {
            debug!(context_id = %context_id, error = %e, "Trace not recorded");
        }
    }

    // ============= Observability =============

    pub fn task(&self, task_id: &str) -> Option<TaskSnapshot> {
        self.tasks.get(task_id).map(|t| t.snapshot())
    }

    /// Terminal outcome of a finished task still within retention, as it was
    /// published on the outcome feed.
    pub fn outcome(&self, task_id: &str) -> Option<DispatchOutcome> {
        self.tasks
            .get(task_id)
            .filter(|t| t.status.is_terminal())
            .map(|t| outcome_of(&t))
    }

    pub fn stats(&self) -> DispatchStats {
        let (queued, in_flight) = self.tasks.iter().fold((0, 0), |(q, f), t| {
            match t.status {
                TaskStatus::Submitted => (q + 1, f),
                TaskStatus::Dispatched | TaskStatus::Running => (q, f + 1),
                _ => (q, f),
            }
        });
        DispatchStats {
            queued,
            in_flight,
            submitted_total: self.counters.submitted.load(AtomicOrdering::Relaxed),
            dispatched_total: self.counters.dispatched.load(AtomicOrdering::Relaxed),
            retried_total: self.counters.retried.load(AtomicOrdering::Relaxed),
            completed_total: self.counters.completed.load(AtomicOrdering::Relaxed),
            failed_total: self.counters.failed.load(AtomicOrdering::Relaxed),
            cancelled_total: self.counters.cancelled.load(AtomicOrdering::Relaxed),
        }
    }
}

fn outcome_of(task: &Task) -> DispatchOutcome {
    DispatchOutcome {
        task_id: task.id.clone(),
        context_id: task.request.context_id.clone(),
        stage: task.request.stage.clone(),
        origin_session: task.request.origin_session.clone(),
        status: task.status,
        agent_id: task.assigned_agent.clone(),
        attempts: task.attempt,
        result: task.result.clone().unwrap_or(Value::Null),
        error: task.last_error.clone(),
        cancelled: task.cancelled,
    }
}
