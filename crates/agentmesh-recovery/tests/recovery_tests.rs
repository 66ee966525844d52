//! Tests for agentmesh-recovery: decisions, attempt budgets, ledger, escalation

use agentmesh_agent::{Agent, AgentHandle, HandlerContext, RuntimeOptions};
use agentmesh_core::config::{HealthConfig, RecoveryConfig};
use agentmesh_core::*;
use agentmesh_recovery::*;
use agentmesh_registry::{AgentHealth, Registry};
use std::result::Result;
use std::sync::Arc;

fn config() -> RecoveryConfig {
    RecoveryConfig {
        timeout_max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 10_000,
        jitter_ratio: 0.5,
        ..Default::default()
    }
}

fn timeout_failure(attempt: u32) -> Failure {
    Failure::new(ExecutionError::timeout("step b", 50).into(), attempt)
        .agent(Some("a1".into()))
        .step("b".into())
}

// ===========================================================================
// Decisions
// ===========================================================================

#[test]
fn timeout_retries_with_increasing_delay_then_gives_up() {
    let recovery = Recovery::from_config(&config());
    let first = recovery.decide(&timeout_failure(1));
    let second = recovery.decide(&timeout_failure(2));
    let third = recovery.decide(&timeout_failure(3));

    assert!(matches!(first, Decision::Retry { .. }));
    assert!(matches!(second, Decision::Retry { .. }));
    assert!(first.delay() < second.delay());
    assert_eq!(third, Decision::GiveUp);
}

#[test]
fn routing_failures_reroute() {
    let recovery = Recovery::from_config(&config());
    let gone = Failure::new(RoutingError::AgentUnavailable("a1".into()).into(), 1);
    assert!(matches!(recovery.decide(&gone), Decision::Reroute { .. }));
    let busy = Failure::new(ExecutionError::ResourceExhaustion("queue full".into()).into(), 1);
    assert!(matches!(recovery.decide(&busy), Decision::Reroute { .. }));
}

#[test]
fn application_errors_are_not_retried() {
    let recovery = Recovery::from_config(&config());
    let failure = Failure::new(ExecutionError::application("bad payload").into(), 1);
    assert_eq!(recovery.decide(&failure), Decision::GiveUp);
    let attempts = recovery.ledger().attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].strategy, "default");
    assert_eq!(attempts[0].outcome, AttemptOutcome::GaveUp);
}

#[tokio::test]
async fn exhausted_corruption_escalates_to_supervisor() {
    let recovery = Recovery::from_config(&config());
    let mut supervisor = recovery.subscribe();
    let corrupt = |attempt| {
        Failure::new(ExecutionError::StateCorruption("bad index".into()).into(), attempt)
            .agent(Some("a7".into()))
    };

    assert!(matches!(recovery.decide(&corrupt(1)), Decision::Recreate { .. }));
    assert_eq!(recovery.decide(&corrupt(2)), Decision::Escalate);

    let escalation = supervisor.recv().await.unwrap();
    assert_eq!(escalation.agent, Some(AgentId::new("a7")));
    assert_eq!(escalation.kind, FailureKind::StateCorruption);
    assert_eq!(escalation.attempts, 2);
    assert!(escalation.reason.contains("bad index"));
}

#[test]
fn escalate_action_publishes_without_subscribers() {
    let factory = StrategyFactory::new().for_kind(
        FailureKind::Timeout,
        RecoveryStrategy::new("page-someone", 5, Backoff::None, RecoveryAction::Escalate),
    );
    let recovery = Recovery::new(factory);
    assert_eq!(recovery.decide(&timeout_failure(1)), Decision::Escalate);
    assert_eq!(
        recovery.ledger().attempts()[0].outcome,
        AttemptOutcome::Escalated
    );
}

// ===========================================================================
// Ledger
// ===========================================================================

#[test]
fn ledger_counts_per_agent_and_kind() {
    let recovery = Recovery::from_config(&config());
    recovery.decide(&timeout_failure(1));
    recovery.decide(&timeout_failure(2));
    recovery.decide(&Failure::new(RoutingError::NoEligibleAgent("embed".into()).into(), 1));

    let ledger = recovery.ledger();
    assert_eq!(ledger.len(), 3);
    assert_eq!(ledger.for_kind(FailureKind::Timeout), 2);
    assert_eq!(ledger.for_kind(FailureKind::ResourceExhaustion), 1);
    use agentmesh_registry::RecoveryCounts;
    assert_eq!(ledger.attempts_for_agent(&"a1".into()), 2);
    assert_eq!(ledger.attempts_for_agent(&"nobody".into()), 0);
}

struct Idle;

#[async_trait::async_trait]
impl Agent for Idle {
    fn agent_type(&self) -> &str {
        "idle"
    }

    async fn handle(&mut self, ctx: &HandlerContext, message: Message) -> Result<Message, ExecutionError> {
        Ok(message.reply(&ctx.agent_id, serde_json::Value::Null))
    }
}

#[tokio::test]
async fn health_reports_read_ledger_counts() {
    let mut caps = CapabilitySet::new();
    caps.add(Capability::new("embed", "1")).unwrap();
    let handle = AgentHandle::spawn("a1", Box::new(Idle), caps, RuntimeOptions::default())
        .await
        .unwrap();
    let registry = Arc::new(Registry::default());
    registry.register(handle);

    let recovery = Recovery::from_config(&config());
    recovery.decide(&timeout_failure(1));
    let health = AgentHealth::new(registry, HealthConfig::default()).with_recovery(recovery.ledger());
    assert_eq!(health.report(&"a1".into()).unwrap().recovery_attempts, 1);
}
