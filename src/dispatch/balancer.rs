//! Load-balancing policies for picking one agent among capable candidates.
//!
//! All policies are deterministic for a given candidate list and history;
//! candidates arrive sorted by agent id and ties always break by id.

use crate::agents::AgentSnapshot;
use crate::types::AppError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Rotate through candidates per capability
    RoundRobin,
    /// Smooth weighted rotation, weight = free slots
    Weighted,
    /// Fewest in-flight tasks
    LeastConnections,
    /// Blend of load ratio and observed latency
    #[default]
    Adaptive,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round_robin",
            LoadBalanceStrategy::Weighted => "weighted",
            LoadBalanceStrategy::LeastConnections => "least_connections",
            LoadBalanceStrategy::Adaptive => "adaptive",
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least_connections" | "leastconnections" => Ok(Self::LeastConnections),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(AppError::InvalidInput(format!(
                "unknown load balance strategy '{}'",
                other
            ))),
        }
    }
}

/// Selection state shared by all dispatcher workers.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    round_robin: DashMap<String, usize>,
    smooth_weights: DashMap<String, HashMap<String, i64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a candidate for `key` (the task's capability).
    pub fn select<'a>(
        &self,
        strategy: LoadBalanceStrategy,
        key: &str,
        candidates: &'a [AgentSnapshot],
        latency_weight: f64,
    ) -> Option<&'a AgentSnapshot> {
        if candidates.is_empty() {
            return None;
        }

        match strategy {
            LoadBalanceStrategy::RoundRobin => {
                let mut counter = self.round_robin.entry(key.to_string()).or_insert(0);
                let idx = *counter % candidates.len();
                *counter = counter.wrapping_add(1);
                candidates.get(idx)
            }
            LoadBalanceStrategy::LeastConnections => candidates
                .iter()
                .min_by(|a, b| a.load.cmp(&b.load).then_with(|| a.agent_id.cmp(&b.agent_id))),
            LoadBalanceStrategy::Weighted => self.smooth_weighted(key, candidates),
            LoadBalanceStrategy::Adaptive => adaptive(candidates, latency_weight),
        }
    }

    fn smooth_weighted<'a>(
        &self,
        key: &str,
        candidates: &'a [AgentSnapshot],
    ) -> Option<&'a AgentSnapshot> {
        let mut state = self.smooth_weights.entry(key.to_string()).or_default();
        state.retain(|id, _| candidates.iter().any(|c| &c.agent_id == id));

        let weight = |c: &AgentSnapshot| i64::from(c.max_concurrency.saturating_sub(c.load).max(1));
        let total: i64 = candidates.iter().map(weight).sum();

        let mut best: Option<(&AgentSnapshot, i64)> = None;
        for candidate in candidates {
            let current = state.entry(candidate.agent_id.clone()).or_insert(0);
            *current += weight(candidate);
            let better = match best {
                None => true,
                Some((_, score)) => *current > score,
            };
            if better {
                best = Some((candidate, *current));
            }
        }

        let (chosen, _) = best?;
        if let Some(current) = state.get_mut(&chosen.agent_id) {
            *current -= total;
        }
        Some(chosen)
    }
}

fn adaptive(candidates: &[AgentSnapshot], latency_weight: f64) -> Option<&AgentSnapshot> {
    let slowest = candidates
        .iter()
        .filter_map(|c| c.avg_latency_ms)
        .fold(0.0_f64, f64::max);

    let score = |c: &AgentSnapshot| {
        let load = f64::from(c.load) / f64::from(c.max_concurrency.max(1));
        let latency = match (c.avg_latency_ms, slowest > 0.0) {
            (Some(ms), true) => ms / slowest,
            _ => 0.0,
        };
        (1.0 - latency_weight) * load + latency_weight * latency
    };

    candidates.iter().min_by(|a, b| {
        score(a)
            .total_cmp(&score(b))
            .then_with(|| a.load.cmp(&b.load))
            .then_with(|| a.agent_id.cmp(&b.agent_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentSnapshot;
    use rstest::rstest;

    fn agent(id: &str, load: u32, max: u32, latency: Option<f64>) -> AgentSnapshot {
        let mut snap = AgentSnapshot::for_tests(id, &["search"], max);
        snap.load = load;
        snap.avg_latency_ms = latency;
        snap
    }

    #[rstest]
    #[case("round_robin", LoadBalanceStrategy::RoundRobin)]
    #[case("RoundRobin", LoadBalanceStrategy::RoundRobin)]
    #[case("weighted", LoadBalanceStrategy::Weighted)]
    #[case("least_connections", LoadBalanceStrategy::LeastConnections)]
    #[case(" adaptive ", LoadBalanceStrategy::Adaptive)]
    fn test_parse_strategy(#[case] raw: &str, #[case] expected: LoadBalanceStrategy) {
        assert_eq!(raw.parse::<LoadBalanceStrategy>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_strategy() {
        assert!("fastest".parse::<LoadBalanceStrategy>().is_err());
    }

    #[test]
    fn test_round_robin_rotates_per_capability() {
        let lb = LoadBalancer::new();
        let pool = vec![agent("a", 0, 2, None), agent("b", 0, 2, None)];

        let picks: Vec<_> = (0..4)
            .map(|_| {
                lb.select(LoadBalanceStrategy::RoundRobin, "search", &pool, 0.5)
                    .unwrap()
                    .agent_id
                    .clone()
            })
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);

        let other = lb
            .select(LoadBalanceStrategy::RoundRobin, "plan", &pool, 0.5)
            .unwrap();
        assert_eq!(other.agent_id, "a");
    }

    #[test]
    fn test_least_connections_breaks_ties_by_id() {
        let lb = LoadBalancer::new();
        let pool = vec![
            agent("a", 2, 4, None),
            agent("b", 1, 4, None),
            agent("c", 1, 4, None),
        ];
        let pick = lb
            .select(LoadBalanceStrategy::LeastConnections, "search", &pool, 0.5)
            .unwrap();
        assert_eq!(pick.agent_id, "b");
    }

    #[test]
    fn test_weighted_favours_free_capacity() {
        let lb = LoadBalancer::new();
        let pool = vec![agent("a", 0, 3, None), agent("b", 0, 1, None)];

        let mut counts = HashMap::new();
        for _ in 0..8 {
            let pick = lb
                .select(LoadBalanceStrategy::Weighted, "search", &pool, 0.5)
                .unwrap();
            *counts.entry(pick.agent_id.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 6);
        assert_eq!(counts["b"], 2);
    }

    #[test]
    fn test_adaptive_prefers_idle_fast_agent() {
        let lb = LoadBalancer::new();
        let pool = vec![
            agent("a", 1, 2, Some(400.0)),
            agent("b", 1, 2, Some(100.0)),
            agent("c", 0, 2, Some(400.0)),
        ];
        // c: 0.5*0 + 0.5*1 = 0.5, b: 0.5*0.5 + 0.5*0.25 = 0.375
        let pick = lb
            .select(LoadBalanceStrategy::Adaptive, "search", &pool, 0.5)
            .unwrap();
        assert_eq!(pick.agent_id, "b");

        let load_only = lb
            .select(LoadBalanceStrategy::Adaptive, "search", &pool, 0.0)
            .unwrap();
        assert_eq!(load_only.agent_id, "c");
    }

    #[test]
    fn test_selection_is_deterministic() {
        let pool = vec![agent("x", 0, 1, None), agent("y", 0, 1, None)];
        for strategy in [
            LoadBalanceStrategy::LeastConnections,
            LoadBalanceStrategy::Adaptive,
        ] {
            let first = LoadBalancer::new()
                .select(strategy, "k", &pool, 0.5)
                .unwrap()
                .agent_id
                .clone();
            let second = LoadBalancer::new()
                .select(strategy, "k", &pool, 0.5)
                .unwrap()
                .agent_id
                .clone();
            assert_eq!(first, second);
            assert_eq!(first, "x");
        }
    }

    #[test]
    fn test_empty_candidates() {
        let lb = LoadBalancer::new();
        assert!(lb
            .select(LoadBalanceStrategy::Adaptive, "search", &[], 0.5)
            .is_none());
    }
}
