//! Routing, retry, circuit breaking and timeout behavior of the dispatcher.

mod common;

use ares_mcp::{
    agents::AgentRegistration,
    dispatch::{CircuitState, LoadBalanceStrategy, TaskRequest},
    types::{AgentType, TaskStatus},
    HubConfig,
};
use common::{completed, failed, harness, register};
use rstest::rstest;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

fn search() -> TaskRequest {
    TaskRequest::new("literature_search", "search", json!({ "query": "crispr off-target" }))
}

// ============= Queueing =============

#[test]
fn test_second_task_waits_for_free_slot() {
    let h = harness(HubConfig::default());
    register(&h, "lit-1", "literature_search", 1);

    let first = h.dispatcher.submit(search()).unwrap();
    let second = h.dispatcher.submit(search()).unwrap();
    let now = Instant::now();
    h.dispatcher.run_pending(now);

    assert_eq!(h.dispatcher.task(&first).unwrap().status, TaskStatus::Dispatched);
    assert_eq!(h.dispatcher.task(&second).unwrap().status, TaskStatus::Submitted);
    assert_eq!(h.transport.submits_to("lit-1").len(), 1);

    h.dispatcher
        .on_task_result("lit-1", None, &completed(&first, "lit-1", json!({ "papers": 12 })), now)
        .unwrap();
    h.dispatcher.unpark_all();
    h.dispatcher.run_pending(now);

    let second = h.dispatcher.task(&second).unwrap();
    assert_eq!(second.status, TaskStatus::Dispatched);
    assert_eq!(second.assigned_agent.as_deref(), Some("lit-1"));
    assert_eq!(h.registry.get("lit-1").unwrap().load, 1);
}

#[test]
fn test_higher_priority_dispatched_first() {
    let h = harness(HubConfig::default());
    register(&h, "lit-1", "literature_search", 1);

    let low = h.dispatcher.submit(search().with_priority(1)).unwrap();
    let high = h.dispatcher.submit(search().with_priority(9)).unwrap();
    h.dispatcher.run_pending(Instant::now());

    assert_eq!(h.dispatcher.task(&high).unwrap().status, TaskStatus::Dispatched);
    assert_eq!(h.dispatcher.task(&low).unwrap().status, TaskStatus::Submitted);
}

#[test]
fn test_agent_type_constraint_respected() {
    let h = harness(HubConfig::default());
    register(&h, "lit-1", "literature_search", 2);
    h.registry
        .register(AgentRegistration::new(
            "exec-1",
            AgentType::Executor,
            ["literature_search"],
            2,
        ))
        .unwrap();

    let id = h
        .dispatcher
        .submit(search().with_agent_type(AgentType::Executor))
        .unwrap();
    h.dispatcher.run_pending(Instant::now());

    assert_eq!(
        h.dispatcher.task(&id).unwrap().assigned_agent.as_deref(),
        Some("exec-1")
    );
}

#[test]
fn test_no_capable_agent_fails_after_wait_bound() {
    let h = harness(HubConfig::default());
    let mut outcomes = h.dispatcher.subscribe();

    let id = h
        .dispatcher
        .submit(
            search()
                .with_timeout(Duration::from_secs(5))
                .with_origin("client-1"),
        )
        .unwrap();
    let start = Instant::now();
    h.dispatcher.run_pending(start);

    h.dispatcher.check_timeouts(start + Duration::from_secs(4));
    assert_eq!(h.dispatcher.task(&id).unwrap().status, TaskStatus::Submitted);

    h.dispatcher.check_timeouts(start + Duration::from_secs(5));
    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.error.unwrap().code, "NO_CAPABLE_AGENT");

    let results = h.transport.results_to_session("client-1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].reason_code.as_deref(), Some("NO_CAPABLE_AGENT"));
    assert!(outcomes.try_recv().is_ok());
    assert!(outcomes.try_recv().is_err());
}

#[test]
fn test_parked_task_dispatched_when_agent_registers() {
    let h = harness(HubConfig::default());
    let id = h.dispatcher.submit(search()).unwrap();
    let now = Instant::now();
    h.dispatcher.run_pending(now);
    assert_eq!(h.dispatcher.task(&id).unwrap().status, TaskStatus::Submitted);

    register(&h, "lit-late", "literature_search", 1);
    assert_eq!(h.dispatcher.unpark_all(), 1);
    h.dispatcher.run_pending(now);

    assert_eq!(
        h.dispatcher.task(&id).unwrap().assigned_agent.as_deref(),
        Some("lit-late")
    );
}

// ============= Retry =============

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
fn test_retry_bound_yields_single_terminal_event(#[case] retries: u32) {
    let mut config = HubConfig::default();
    config.dispatch.retry_attempts = retries;
    config.circuit_breaker.enabled = false;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);
    let mut outcomes = h.dispatcher.subscribe();

    let id = h.dispatcher.submit(search().with_origin("client-1")).unwrap();
    let now = Instant::now();
    for _ in 0..=retries {
        h.dispatcher.run_pending(now);
        let agent = h.dispatcher.task(&id).unwrap().assigned_agent.unwrap();
        h.dispatcher
            .on_task_result(&agent, None, &failed(&id, &agent, "rate limited"), now)
            .unwrap();
    }

    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Failed);
    assert_eq!(snap.attempt, retries + 1);
    assert_eq!(snap.error.unwrap().code, "MAX_RETRIES_EXCEEDED");
    assert_eq!(h.transport.submits_to("lit-1").len() as u32, retries + 1);

    let outcome = outcomes.try_recv().unwrap();
    assert_eq!(outcome.attempts, retries + 1);
    assert!(outcomes.try_recv().is_err());
    assert_eq!(h.transport.results_to_session("client-1").len(), 1);
    assert_eq!(h.registry.get("lit-1").unwrap().load, 0);
}

#[test]
fn test_success_after_retry_reports_completion() {
    let mut config = HubConfig::default();
    config.circuit_breaker.enabled = false;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);
    register(&h, "lit-2", "literature_search", 1);
    let mut outcomes = h.dispatcher.subscribe();

    let id = h.dispatcher.submit(search().with_origin("client-1")).unwrap();
    let now = Instant::now();
    h.dispatcher.run_pending(now);
    let first = h.dispatcher.task(&id).unwrap().assigned_agent.unwrap();
    h.dispatcher
        .on_task_result(&first, None, &failed(&id, &first, "crashed"), now)
        .unwrap();

    h.dispatcher.run_pending(now);
    let second = h.dispatcher.task(&id).unwrap().assigned_agent.unwrap();
    assert_ne!(first, second);
    h.dispatcher
        .on_task_result(&second, None, &completed(&id, &second, json!({ "papers": 4 })), now)
        .unwrap();

    let outcome = outcomes.try_recv().unwrap();
    assert!(outcome.succeeded());
    assert!(outcome.error.is_none());
    assert_eq!(outcome.attempts, 2);

    let results = h.transport.results_to_session("client-1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, TaskStatus::Completed);
    assert!(results[0].reason_code.is_none());
    assert_eq!(h.dispatcher.stats().completed_total, 1);
    assert_eq!(h.dispatcher.stats().failed_total, 0);
}

#[test]
fn test_result_from_wrong_agent_ignored() {
    let h = harness(HubConfig::default());
    register(&h, "lit-1", "literature_search", 1);
    let id = h.dispatcher.submit(search()).unwrap();
    let now = Instant::now();
    h.dispatcher.run_pending(now);

    let accepted = h
        .dispatcher
        .on_task_result("lit-9", None, &completed(&id, "lit-9", json!({})), now)
        .unwrap();
    assert!(!accepted);
    assert_eq!(h.dispatcher.task(&id).unwrap().status, TaskStatus::Dispatched);
}

#[test]
fn test_result_for_unknown_task_rejected() {
    let h = harness(HubConfig::default());
    let err = h
        .dispatcher
        .on_task_result("lit-1", None, &completed("nope", "lit-1", json!({})), Instant::now())
        .unwrap_err();
    assert_eq!(err.code(), "TASK_NOT_FOUND");
}

#[test]
fn test_disconnected_agent_work_moves_elsewhere() {
    let h = harness(HubConfig::default());
    register(&h, "lit-1", "literature_search", 1);
    let id = h.dispatcher.submit(search()).unwrap();
    let now = Instant::now();
    h.dispatcher.run_pending(now);
    let first = h.dispatcher.task(&id).unwrap().assigned_agent.unwrap();

    h.registry.evict(&first);
    register(&h, "lit-2", "literature_search", 1);
    assert_eq!(h.dispatcher.on_agent_disconnected(&first, now), 1);
    h.dispatcher.run_pending(now);

    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.assigned_agent.as_deref(), Some("lit-2"));
    assert_eq!(snap.attempt, 2);
}

// ============= Timeouts =============

#[test]
fn test_agent_declared_timeout_applies() {
    let h = harness(HubConfig::default());
    h.registry
        .register(
            AgentRegistration::new("lit-1", AgentType::LiteratureSearch, ["literature_search"], 1)
                .with_task_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    let id = h.dispatcher.submit(search()).unwrap();
    let start = Instant::now();
    h.dispatcher.run_pending(start);
    assert_eq!(h.transport.submits_to("lit-1")[0].timeout, Some(5));

    h.dispatcher.check_timeouts(start + Duration::from_secs(5));
    assert_eq!(h.transport.count("lit-1", "research_action"), 1);

    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.error.unwrap().code, "DISPATCH_TIMEOUT");
    assert_eq!(h.registry.get("lit-1").unwrap().load, 0);
}

#[test]
fn test_late_result_after_timeout_is_stale() {
    let mut config = HubConfig::default();
    config.dispatch.task_timeout_secs = 10;
    config.dispatch.retry_attempts = 0;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);
    let mut outcomes = h.dispatcher.subscribe();

    let id = h.dispatcher.submit(search()).unwrap();
    let start = Instant::now();
    h.dispatcher.run_pending(start);
    h.dispatcher.check_timeouts(start + Duration::from_secs(10));
    assert_eq!(h.dispatcher.task(&id).unwrap().status, TaskStatus::Failed);

    let late = start + Duration::from_secs(11);
    assert!(!h
        .dispatcher
        .on_task_result("lit-1", None, &completed(&id, "lit-1", json!({})), late)
        .unwrap());
    assert!(outcomes.try_recv().is_ok());
    assert!(outcomes.try_recv().is_err());
}

#[test]
fn test_late_result_cannot_complete_retry_on_same_agent() {
    let mut config = HubConfig::default();
    config.dispatch.task_timeout_secs = 10;
    config.dispatch.retry_attempts = 1;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);

    let id = h.dispatcher.submit(search()).unwrap();
    let start = Instant::now();
    h.dispatcher.run_pending(start);
    let retry_at = start + Duration::from_secs(10);
    h.dispatcher.check_timeouts(retry_at);
    h.dispatcher.run_pending(retry_at);

    let attempts: Vec<Option<u32>> = h
        .transport
        .submits_to("lit-1")
        .iter()
        .map(|s| s.attempt)
        .collect();
    assert_eq!(attempts, vec![Some(1), Some(2)]);
    let ids = h.transport.request_ids("lit-1", &id);
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    let late = retry_at + Duration::from_secs(1);
    let stale = completed(&id, "lit-1", json!({ "papers": 1 }));
    assert!(!h
        .dispatcher
        .on_task_result("lit-1", Some(&ids[0]), &stale, late)
        .unwrap());
    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Dispatched);
    assert_eq!(snap.attempt, 2);

    h.dispatcher
        .mark_running(&id, "lit-1", Some(&ids[0]))
        .unwrap();
    assert_eq!(h.dispatcher.task(&id).unwrap().status, TaskStatus::Dispatched);

    let fresh = completed(&id, "lit-1", json!({ "papers": 2 }));
    assert!(h
        .dispatcher
        .on_task_result("lit-1", Some(&ids[1]), &fresh, late)
        .unwrap());
    let snap = h.dispatcher.task(&id).unwrap();
    assert_eq!(snap.status, TaskStatus::Completed);
    assert_eq!(snap.result.unwrap()["papers"], 2);
}

// ============= Circuit Breaker =============

#[test]
fn test_open_circuit_excludes_agent_until_single_trial() {
    let mut config = HubConfig::default();
    config.dispatch.retry_attempts = 0;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.cooldown_secs = 30;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 2);
    h.transport.cut("lit-1");

    let start = Instant::now();
    for _ in 0..2 {
        h.dispatcher.submit(search()).unwrap();
        h.dispatcher.run_pending(start);
    }
    assert_eq!(h.registry.breakers().state("lit-1", start), CircuitState::Open);
    assert!(h.registry.query_at("literature_search", start).is_empty());

    h.transport.restore("lit-1");
    let trial = h.dispatcher.submit(search()).unwrap();
    h.dispatcher.run_pending(start);
    assert_eq!(h.dispatcher.task(&trial).unwrap().status, TaskStatus::Submitted);

    let later = start + Duration::from_secs(30);
    assert_eq!(h.registry.breakers().state("lit-1", later), CircuitState::HalfOpen);
    let queued = h.dispatcher.submit(search()).unwrap();
    h.dispatcher.unpark_all();
    h.dispatcher.run_pending(later);

    assert_eq!(h.dispatcher.task(&trial).unwrap().status, TaskStatus::Dispatched);
    assert_eq!(h.dispatcher.task(&queued).unwrap().status, TaskStatus::Submitted);
    assert_eq!(h.transport.submits_to("lit-1").len(), 1);

    h.dispatcher
        .on_task_result("lit-1", None, &completed(&trial, "lit-1", json!({})), later)
        .unwrap();
    assert_eq!(h.registry.breakers().state("lit-1", later), CircuitState::Closed);

    h.dispatcher.unpark_all();
    h.dispatcher.run_pending(later);
    assert_eq!(h.dispatcher.task(&queued).unwrap().status, TaskStatus::Dispatched);
}

#[test]
fn test_open_circuits_reported_as_circuit_open() {
    let mut config = HubConfig::default();
    config.dispatch.retry_attempts = 0;
    config.circuit_breaker.failure_threshold = 1;
    config.circuit_breaker.cooldown_secs = 120;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);
    h.transport.cut("lit-1");

    let start = Instant::now();
    h.dispatcher.submit(search()).unwrap();
    h.dispatcher.run_pending(start);

    let id = h
        .dispatcher
        .submit(search().with_timeout(Duration::from_secs(5)))
        .unwrap();
    h.dispatcher.run_pending(start);
    h.dispatcher.check_timeouts(start + Duration::from_secs(5));

    assert_eq!(h.dispatcher.task(&id).unwrap().error.unwrap().code, "CIRCUIT_OPEN");
}

// ============= Load Balancing =============

fn round_robin_assignments() -> Vec<String> {
    let mut config = HubConfig::default();
    config.dispatch.strategy = LoadBalanceStrategy::RoundRobin;
    let h = harness(config);
    for id in ["lit-3", "lit-1", "lit-2"] {
        register(&h, id, "literature_search", 2);
    }

    let ids: Vec<String> = (0..6)
        .map(|_| h.dispatcher.submit(search()).unwrap())
        .collect();
    h.dispatcher.run_pending(Instant::now());

    ids.iter()
        .map(|id| h.dispatcher.task(id).unwrap().assigned_agent.unwrap())
        .collect()
}

#[test]
fn test_round_robin_is_deterministic() {
    let first = round_robin_assignments();
    assert_eq!(
        first,
        vec!["lit-1", "lit-2", "lit-3", "lit-1", "lit-2", "lit-3"]
    );
    assert_eq!(first, round_robin_assignments());
}

#[rstest]
#[case(LoadBalanceStrategy::LeastConnections)]
#[case(LoadBalanceStrategy::Weighted)]
#[case(LoadBalanceStrategy::Adaptive)]
fn test_strategies_never_exceed_capacity(#[case] strategy: LoadBalanceStrategy) {
    let mut config = HubConfig::default();
    config.dispatch.strategy = strategy;
    let h = harness(config);
    register(&h, "lit-1", "literature_search", 1);
    register(&h, "lit-2", "literature_search", 3);

    for _ in 0..6 {
        h.dispatcher.submit(search()).unwrap();
    }
    h.dispatcher.run_pending(Instant::now());

    assert_eq!(h.registry.get("lit-1").unwrap().load, 1);
    assert_eq!(h.registry.get("lit-2").unwrap().load, 3);
    let stats = h.dispatcher.stats();
    assert_eq!(stats.in_flight, 4);
    assert_eq!(stats.queued, 2);
}
