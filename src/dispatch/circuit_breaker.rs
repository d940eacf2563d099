//! Per-agent circuit breaking.
//!
//! Each breaker is an explicit state machine driven by the caller's clock so
//! it can be exercised without I/O:
//!
//! ```text
//! Closed --(threshold consecutive failures)--> Open
//! Open   --(cool-down elapsed)---------------> HalfOpen (one trial)
//! HalfOpen --success--> Closed (cool-down reset)
//! HalfOpen --failure--> Open (cool-down doubled, bounded)
//! ```

use crate::utils::toml_config::CircuitBreakerConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use utoipa::ToSchema;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, tasks flow normally
    Closed,
    /// Circuit is open, the agent is excluded from routing
    Open,
    /// Cool-down elapsed, a single trial task is allowed
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl BreakerInner {
    /// Lazily promote an expired open circuit to half-open.
    fn refresh(&mut self, now: Instant) {
        if self.state == CircuitState::Open {
            if let Some(opened) = self.opened_at {
                if now.saturating_duration_since(opened) >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = false;
                }
            }
        }
    }
}

/// Observability view of one breaker.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub cooldown_secs: u64,
    pub trial_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown,
                trial_in_flight: false,
            }),
        }
    }

    pub fn state_at(&self, now: Instant) -> CircuitState {
        let mut inner = self.inner.lock();
        inner.refresh(now);
        inner.state
    }

    /// Whether routing may consider this agent at `now`.
    pub fn is_available_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.refresh(now);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !inner.trial_in_flight,
        }
    }

    /// Claim the right to send a task. In half-open state only the first
    /// caller wins until the trial reports back.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        inner.refresh(now);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Returns the new state when the call changed it.
    pub fn record_success(&self, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                inner.cooldown = config.cooldown();
                Some(CircuitState::Closed)
            }
            _ => None,
        }
    }

    /// Returns the new state when the call changed it.
    pub fn record_failure_at(
        &self,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitState> {
        let mut inner = self.inner.lock();
        inner.refresh(now);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.cooldown = config.cooldown();
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                inner.cooldown = (inner.cooldown * 2).min(config.max_cooldown());
                Some(CircuitState::Open)
            }
            // Late report from an attempt started before the circuit opened
            CircuitState::Open => {
                inner.consecutive_failures += 1;
                None
            }
        }
    }

    /// Give back a half-open trial that ended without a verdict.
    pub fn release_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        inner.refresh(now);
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            cooldown_secs: inner.cooldown.as_secs(),
            trial_in_flight: inner.trial_in_flight,
        }
    }
}

/// Breakers keyed by agent instance. Missing entries behave as closed.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(agent_id).map(|b| Arc::clone(b.value()))
    }

    fn get_or_create(&self, agent_id: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(config.cooldown())))
                .value(),
        )
    }

    pub fn is_available(&self, agent_id: &str, now: Instant, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }
        self.get(agent_id).is_none_or(|b| b.is_available_at(now))
    }

    pub fn try_acquire(&self, agent_id: &str, now: Instant, config: &CircuitBreakerConfig) -> bool {
        if !config.enabled {
            return true;
        }
        self.get(agent_id).is_none_or(|b| b.try_acquire_at(now))
    }

    pub fn record_success(&self, agent_id: &str, config: &CircuitBreakerConfig) -> Option<CircuitState> {
        if !config.enabled {
            return None;
        }
        self.get(agent_id).and_then(|b| b.record_success(config))
    }

    pub fn record_failure(
        &self,
        agent_id: &str,
        now: Instant,
        config: &CircuitBreakerConfig,
    ) -> Option<CircuitState> {
        if !config.enabled {
            return None;
        }
        self.get_or_create(agent_id, config)
            .record_failure_at(now, config)
    }

    pub fn release_trial(&self, agent_id: &str) {
        if let Some(b) = self.get(agent_id) {
            b.release_trial();
        }
    }

    pub fn state(&self, agent_id: &str, now: Instant) -> CircuitState {
        self.get(agent_id)
            .map(|b| b.state_at(now))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, agent_id: &str, now: Instant) -> Option<BreakerSnapshot> {
        self.get(agent_id).map(|b| b.snapshot_at(now))
    }

    pub fn remove(&self, agent_id: &str) {
        self.breakers.remove(agent_id);
    }
}
