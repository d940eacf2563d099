//! Agent Registry for tracking connected worker agents
//!
//! The registry is the single source of truth for which agents exist, what
//! they can do, how busy they are and whether they are alive. The dispatcher
//! reads snapshots; only the registry mutates entries.
//!
//! ## Health
//!
//! - `healthy`: heartbeat within `interval × grace`, spare capacity
//! - `degraded`: heartbeat fresh, every slot busy
//! - `unreachable`: heartbeat missed for `interval × grace`; kept for
//!   observability until the TTL elapses, never routed to

use crate::dispatch::{CircuitBreakerRegistry, CircuitState};
use crate::types::{AgentType, AppError, HealthStatus, Result};
use crate::utils::toml_config::HubConfigManager;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// Smoothing factor for the latency moving average.
const LATENCY_ALPHA: f64 = 0.3;

/// Registration request for one agent instance.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub max_concurrency: u32,
    pub task_timeout: Option<Duration>,
    pub session_id: Option<String>,
}

impl AgentRegistration {
    pub fn new(
        agent_id: impl Into<String>,
        agent_type: AgentType,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        max_concurrency: u32,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            max_concurrency,
            task_timeout: None,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
struct AgentEntry {
    agent_id: String,
    agent_type: AgentType,
    capabilities: BTreeSet<String>,
    max_concurrency: u32,
    load: u32,
    last_heartbeat: Instant,
    marked_unreachable: bool,
    registered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    session_id: Option<String>,
    avg_latency_ms: Option<f64>,
    task_timeout: Option<Duration>,
}

impl AgentEntry {
    fn health(&self, now: Instant, unreachable_after: Duration) -> HealthStatus {
        let silent = now.saturating_duration_since(self.last_heartbeat);
        if self.marked_unreachable || silent >= unreachable_after {
            HealthStatus::Unreachable
        } else if self.load >= self.max_concurrency {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Point-in-time view of a registered agent.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub max_concurrency: u32,
    pub load: u32,
    pub health: HealthStatus,
    pub circuit: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<u64>,
}

impl AgentSnapshot {
    pub fn has_capacity(&self) -> bool {
        self.load < self.max_concurrency
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: &str, caps: &[&str], max_concurrency: u32) -> Self {
        Self {
            agent_id: id.to_string(),
            agent_type: AgentType::Executor,
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            max_concurrency,
            load: 0,
            health: HealthStatus::Healthy,
            circuit: CircuitState::Closed,
            session_id: None,
            registered_at: Utc::now(),
            last_seen_at: Utc::now(),
            avg_latency_ms: None,
            task_timeout_secs: None,
        }
    }
}

/// What a sweep changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub marked_unreachable: Vec<String>,
    pub evicted: Vec<String>,
}

/// Registry of live agent instances keyed by agent id.
pub struct AgentRegistry {
    agents: DashMap<String, AgentEntry>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: Arc<HubConfigManager>,
    changes: watch::Sender<u64>,
    shutdown: AtomicBool,
}

impl AgentRegistry {
    pub fn new(config: Arc<HubConfigManager>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            agents: DashMap::new(),
            breakers,
            config,
            changes,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Change feed bumped on membership, health and capacity changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn notify_change(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn unreachable_after(&self) -> Duration {
        self.config.config().heartbeat.unreachable_after()
    }

    fn snapshot_of(&self, entry: &AgentEntry, now: Instant) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: entry.agent_id.clone(),
            agent_type: entry.agent_type,
            capabilities: entry.capabilities.iter().cloned().collect(),
            max_concurrency: entry.max_concurrency,
            load: entry.load,
            health: entry.health(now, self.unreachable_after()),
            circuit: self.breakers.state(&entry.agent_id, now),
            session_id: entry.session_id.clone(),
            registered_at: entry.registered_at,
            last_seen_at: entry.last_seen_at,
            avg_latency_ms: entry.avg_latency_ms,
            task_timeout_secs: entry.task_timeout.map(|d| d.as_secs()),
        }
    }

    /// Register an agent. A stale (unreachable) registration with the same id
    /// is replaced and keeps its in-flight load.
    pub fn register(&self, registration: AgentRegistration) -> Result<AgentSnapshot> {
        self.register_at(registration, Instant::now())
    }

    pub fn register_at(&self, reg: AgentRegistration, now: Instant) -> Result<AgentSnapshot> {
        if reg.agent_id.trim().is_empty() {
            return Err(AppError::InvalidInput("agent_id must not be empty".into()));
        }
        if reg.max_concurrency == 0 {
            return Err(AppError::InvalidInput(format!(
                "agent {} declared max_concurrent = 0",
                reg.agent_id
            )));
        }
        let capabilities: BTreeSet<String> = reg
            .capabilities
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if capabilities.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "agent {} declared no capabilities",
                reg.agent_id
            )));
        }
        if !self.config.config().agents.allows(reg.agent_type) {
            return Err(AppError::AgentTypeNotAllowed(reg.agent_type.to_string()));
        }

        let unreachable_after = self.unreachable_after();
        let wall = Utc::now();
        let mut entry = AgentEntry {
            agent_id: reg.agent_id.clone(),
            agent_type: reg.agent_type,
            capabilities,
            max_concurrency: reg.max_concurrency,
            load: 0,
            last_heartbeat: now,
            marked_unreachable: false,
            registered_at: wall,
            last_seen_at: wall,
            session_id: reg.session_id,
            avg_latency_ms: None,
            task_timeout: reg.task_timeout,
        };

        let snapshot = match self.agents.entry(reg.agent_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().health(now, unreachable_after) != HealthStatus::Unreachable {
                    return Err(AppError::DuplicateRegistration(reg.agent_id));
                }
                entry.load = occupied.get().load;
                entry.avg_latency_ms = occupied.get().avg_latency_ms;
                info!(agent_id = %reg.agent_id, "Replacing stale agent registration");
                occupied.insert(entry.clone());
                self.snapshot_of(&entry, now)
            }
            Entry::Vacant(vacant) => {
                let snapshot = self.snapshot_of(&entry, now);
                vacant.insert(entry);
                snapshot
            }
        };

        info!(
            agent_id = %snapshot.agent_id,
            agent_type = %snapshot.agent_type,
            capabilities = ?snapshot.capabilities,
            max_concurrency = snapshot.max_concurrency,
            "Agent registered"
        );
        self.notify_change();
        Ok(snapshot)
    }

    /// Refresh liveness for an agent.
    pub fn heartbeat(&self, agent_id: &str) -> Result<HealthStatus> {
        self.heartbeat_at(agent_id, Instant::now())
    }

    pub fn heartbeat_at(&self, agent_id: &str, now: Instant) -> Result<HealthStatus> {
        let unreachable_after = self.unreachable_after();
        let (health, recovered) = {
            let mut entry = self
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| AppError::UnknownAgent(agent_id.to_string()))?;
            let recovered = entry.health(now, unreachable_after) == HealthStatus::Unreachable;
            entry.last_heartbeat = now;
            entry.last_seen_at = Utc::now();
            entry.marked_unreachable = false;
            (entry.health(now, unreachable_after), recovered)
        };

        if recovered {
            info!(agent_id = %agent_id, "Agent reachable again");
            self.notify_change();
        } else {
            debug!(agent_id = %agent_id, "Heartbeat");
        }
        Ok(health)
    }

    /// Routable agents offering `capability`, ordered by id.
    pub fn query(&self, capability: &str) -> Vec<AgentSnapshot> {
        self.query_at(capability, Instant::now())
    }

    pub fn query_at(&self, capability: &str, now: Instant) -> Vec<AgentSnapshot> {
        let breaker_config = self.config.config().circuit_breaker.clone();
        let unreachable_after = self.unreachable_after();

        let mut found: Vec<AgentSnapshot> = self
            .agents
            .iter()
            .filter(|e| e.capabilities.contains(capability))
            .filter(|e| e.health(now, unreachable_after) != HealthStatus::Unreachable)
            .filter(|e| self.breakers.is_available(&e.agent_id, now, &breaker_config))
            .map(|e| self.snapshot_of(e.value(), now))
            .collect();
        found.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        found
    }

    /// Whether any registration, routable or not, offers `capability`.
    pub fn any_registered(&self, capability: &str) -> bool {
        self.agents
            .iter()
            .any(|e| e.capabilities.contains(capability))
    }

    /// Mark silent agents unreachable and evict those past the TTL.
    pub fn expire_stale(&self, now: Instant) -> SweepReport {
        let heartbeat = self.config.config().heartbeat.clone();
        let unreachable_after = heartbeat.unreachable_after();
        let evict_after = heartbeat.ttl().max(unreachable_after);
        let mut report = SweepReport::default();

        self.agents.retain(|id, entry| {
            let silent = now.saturating_duration_since(entry.last_heartbeat);
            if silent > evict_after {
                warn!(agent_id = %id, silent_secs = silent.as_secs(), "Evicting stale agent");
                report.evicted.push(id.clone());
                return false;
            }
            if silent >= unreachable_after && !entry.marked_unreachable {
                entry.marked_unreachable = true;
                warn!(agent_id = %id, silent_secs = silent.as_secs(), "Agent unreachable");
                report.marked_unreachable.push(id.clone());
            }
            true
        });

        for id in &report.evicted {
            self.breakers.remove(id);
        }
        if !report.evicted.is_empty() || !report.marked_unreachable.is_empty() {
            self.notify_change();
        }
        report
    }

    /// Remove an agent immediately (e.g. on disconnect).
    pub fn evict(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let now = Instant::now();
        let removed = self
            .agents
            .remove(agent_id)
            .map(|(_, entry)| self.snapshot_of(&entry, now));
        if removed.is_some() {
            info!(agent_id = %agent_id, "Agent evicted");
            self.notify_change();
        }
        removed
    }

    /// Take one concurrency slot on the agent.
    pub fn acquire_slot(&self, agent_id: &str) -> Result<u32> {
        let mut entry = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| AppError::UnknownAgent(agent_id.to_string()))?;
        if entry.load >= entry.max_concurrency {
            return Err(AppError::CapacityExceeded(format!(
                "agent {} is at max_concurrency {}",
                agent_id, entry.max_concurrency
            )));
        }
        entry.load += 1;
        Ok(entry.load)
    }

    /// Free one concurrency slot; unknown agents are ignored.
    pub fn release_slot(&self, agent_id: &str) {
        let released = match self.agents.get_mut(agent_id) {
            Some(mut entry) => {
                entry.load = entry.load.saturating_sub(1);
                true
            }
            None => false,
        };
        if released {
            self.notify_change();
        }
    }

    pub fn record_latency(&self, agent_id: &str, latency: Duration) {
        if let Some(mut entry) = self.agents.get_mut(agent_id) {
            let sample = latency.as_secs_f64() * 1000.0;
            entry.avg_latency_ms = Some(match entry.avg_latency_ms {
                Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
                None => sample,
            });
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentSnapshot> {
        let now = Instant::now();
        self.agents.get(agent_id).map(|e| self.snapshot_of(&e, now))
    }

    pub fn session_of(&self, agent_id: &str) -> Option<String> {
        self.agents.get(agent_id).and_then(|e| e.session_id.clone())
    }

    pub fn task_timeout(&self, agent_id: &str) -> Option<Duration> {
        self.agents.get(agent_id).and_then(|e| e.task_timeout)
    }

    /// All registrations, ordered by id.
    pub fn agents(&self) -> Vec<AgentSnapshot> {
        let now = Instant::now();
        let mut all: Vec<_> = self
            .agents
            .iter()
            .map(|e| self.snapshot_of(e.value(), now))
            .collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn healthy_count(&self) -> usize {
        let now = Instant::now();
        let unreachable_after = self.unreachable_after();
        self.agents
            .iter()
            .filter(|e| e.health(now, unreachable_after) == HealthStatus::Healthy)
            .count()
    }

    /// Spawn the periodic liveness sweep.
    pub fn start_sweep_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = registry.config.config().heartbeat.sweep_interval();

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;

                if registry.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let report = registry.expire_stale(Instant::now());
                if !report.evicted.is_empty() {
                    debug!("Registry sweep: evicted {} stale agents", report.evicted.len());
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
