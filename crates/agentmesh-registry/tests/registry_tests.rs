//! Tests for agentmesh-registry: registration, selection strategies, routing, factory, health

use agentmesh_agent::*;
use agentmesh_core::config::{HealthConfig, RoutingConfig, StrategyName};
use agentmesh_core::*;
use agentmesh_registry::*;
use std::result::Result;
use std::sync::Arc;
use std::time::Duration;

struct Echo {
    fail: bool,
    delay: Duration,
}

#[async_trait::async_trait]
impl Agent for Echo {
    fn agent_type(&self) -> &str {
        "echo"
    }

    async fn handle(&mut self, ctx: &HandlerContext, message: Message) -> Result<Message, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ExecutionError::application("refused"));
        }
        Ok(message.reply(&ctx.agent_id, serde_json::json!({ "by": ctx.agent_id.as_str() })))
    }
}

struct NeverReady;

#[async_trait::async_trait]
impl Agent for NeverReady {
    fn agent_type(&self) -> &str {
        "never-ready"
    }

    async fn initialize(&mut self) -> Result<(), ExecutionError> {
        Err(ExecutionError::CommunicationFailure("backend unreachable".into()))
    }

    async fn handle(&mut self, _: &HandlerContext, _: Message) -> Result<Message, ExecutionError> {
        Err(ExecutionError::application("unreachable"))
    }
}

fn caps(kinds: &[&str]) -> CapabilitySet {
    let mut set = CapabilitySet::new();
    for k in kinds {
        set.add(Capability::new(*k, "1")).unwrap();
    }
    set
}

async fn agent(id: &str, kinds: &[&str]) -> AgentHandle {
    agent_with(id, kinds, false, 0).await
}

async fn agent_with(id: &str, kinds: &[&str], fail: bool, delay_ms: u64) -> AgentHandle {
    let echo = Echo {
        fail,
        delay: Duration::from_millis(delay_ms),
    };
    AgentHandle::spawn(id, Box::new(echo), caps(kinds), RuntimeOptions::default())
        .await
        .unwrap()
}

fn msg() -> Message {
    Message::request("test", Recipient::Capability("embed".into()), serde_json::json!({}))
}

fn ids(agents: &[AgentHandle]) -> Vec<&str> {
    agents.iter().map(|a| a.id().as_str()).collect()
}

// ===========================================================================
// Registration
// ===========================================================================

#[tokio::test]
async fn reregistration_is_idempotent() {
    let registry = Registry::default();
    let a1 = agent("a1", &["embed", "store"]).await;
    registry.register(a1.clone());
    registry.register(a1.clone());
    registry.register_with(a1.clone(), caps(&["embed"])).unwrap();

    let holders = registry.find_by_capability(&"embed".into());
    assert_eq!(ids(&holders), vec!["a1"]);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn find_preserves_registration_order() {
    let registry = Registry::default();
    for id in ["a3", "a1", "a2"] {
        registry.register(agent(id, &["embed"]).await);
    }
    assert_eq!(ids(&registry.find_by_capability(&"embed".into())), vec!["a3", "a1", "a2"]);
}

#[tokio::test]
async fn same_kind_capability_leaves_exactly_one() {
    let registry = Registry::default();
    let a1 = agent("a1", &["embed"]).await;
    registry.register(a1.clone());
    let mut v2 = CapabilitySet::new();
    v2.add(Capability::new("embed", "2")).unwrap();
    registry.register_with(a1.clone(), v2).unwrap();

    let held = a1.capabilities();
    assert_eq!(held.iter().filter(|c| c.kind.as_str() == "embed").count(), 1);
    assert_eq!(held.get(&"embed".into()).unwrap().version, "2");
    assert_eq!(registry.find_by_capability(&"embed".into()).len(), 1);
}

#[tokio::test]
async fn dropped_capability_is_unindexed_on_refresh() {
    let registry = Registry::default();
    let a1 = agent("a1", &["embed", "store"]).await;
    registry.register(a1.clone());
    a1.remove_capability(&"store".into()).unwrap();
    assert!(registry.refresh(a1.id()));
    assert!(registry.find_by_capability(&"store".into()).is_empty());
    assert_eq!(registry.capabilities(), vec![CapabilityKind::new("embed")]);
}

// ===========================================================================
// Selection strategies
// ===========================================================================

#[tokio::test]
async fn performance_based_prefers_lower_error_rate() {
    let registry = Registry::default();
    let a1 = agent("a1", &["embed"]).await;
    let a2 = agent("a2", &["embed"]).await;
    a1.set_performance(PerformanceSnapshot {
        error_rate: 0.5,
        latency_ema_ms: 1.0,
        processed: 10,
        ..Default::default()
    });
    a2.set_performance(PerformanceSnapshot {
        error_rate: 0.0,
        latency_ema_ms: 50.0,
        processed: 10,
        ..Default::default()
    });
    registry.register(a1);
    registry.register(a2);

    let options = RouteOptions::new().strategy(registry.strategy(StrategyName::PerformanceBased));
    for _ in 0..10 {
        let routed = registry.route(&msg(), &"embed".into(), &options).await.unwrap();
        assert_eq!(routed.agent_id.as_str(), "a2");
    }
}

#[tokio::test]
async fn performance_ties_rotate() {
    let registry = Registry::default();
    registry.register(agent("a1", &["embed"]).await);
    registry.register(agent("a2", &["embed"]).await);
    let candidates = registry.eligible(&"embed".into());
    let strategy = PerformanceBased::new();
    let picks: Vec<_> = (0..4)
        .map(|_| strategy.select(&"embed".into(), &candidates).unwrap())
        .collect();
    assert_eq!(picks, vec![0, 1, 0, 1]);
}

#[tokio::test]
async fn round_robin_rotates_through_holders() {
    let registry = Registry::default();
    registry.register(agent("a1", &["embed"]).await);
    registry.register(agent("a2", &["embed"]).await);
    let options = RouteOptions::new();
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(registry.route(&msg(), &"embed".into(), &options).await.unwrap().agent_id);
    }
    let seen: Vec<_> = seen.iter().map(|a| a.as_str()).collect();
    assert_eq!(seen, vec!["a1", "a2", "a1", "a2"]);
}

// ===========================================================================
// Routing
// ===========================================================================

#[tokio::test]
async fn routing_to_departed_agent_fails_fast() {
    let registry = Registry::default();
    let a1 = agent("a1", &["embed"]).await;
    registry.register(a1.clone());
    registry.deregister(a1.id());
    let err = registry.route_to(a1.id(), &msg(), &RouteOptions::new()).await.unwrap_err();
    assert_eq!(err, DispatchError::Routing(RoutingError::AgentUnavailable("a1".into())));

    let a2 = agent("a2", &["embed"]).await;
    registry.register(a2.clone());
    a2.shutdown().await;
    let err = registry.route_to(a2.id(), &msg(), &RouteOptions::new()).await.unwrap_err();
    assert_eq!(err, DispatchError::Routing(RoutingError::AgentUnavailable("a2".into())));
}

#[tokio::test]
async fn no_holder_is_no_eligible_agent() {
    let registry = Registry::default();
    registry.register(agent("a1", &["store"]).await);
    let err = registry
        .route(&msg(), &"embed".into(), &RouteOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::Routing(RoutingError::NoEligibleAgent("embed".into())));
}

#[tokio::test]
async fn excluded_agents_are_skipped_and_failures_are_not_retried() {
    let registry = Registry::default();
    registry.register(agent_with("bad", &["embed"], true, 0).await);
    registry.register(agent("good", &["embed"]).await);

    let first = RouteOptions::new().strategy(registry.strategy(StrategyName::RoundRobin));
    let err = registry.route(&msg(), &"embed".into(), &first).await.unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::Application);

    let reroute = first.clone().exclude([AgentId::new("bad")]);
    for _ in 0..3 {
        let routed = registry.route(&msg(), &"embed".into(), &reroute).await.unwrap();
        assert_eq!(routed.agent_id.as_str(), "good");
    }
}

#[tokio::test]
async fn dispatch_timeout_is_reported_as_timeout() {
    let registry = Registry::new(&RoutingConfig {
        dispatch_timeout_ms: 50,
        ..Default::default()
    });
    registry.register(agent_with("slow", &["embed"], false, 500).await);
    let err = registry
        .route(&msg(), &"embed".into(), &RouteOptions::new())
        .await
        .unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::Timeout);
}

#[tokio::test]
async fn broadcast_is_independent_per_agent() {
    let registry = Registry::default();
    registry.register(agent("a1", &["embed"]).await);
    registry.register(agent_with("a2", &["embed"], true, 0).await);
    registry.register(agent("a3", &["embed"]).await);
    registry.register(agent("other", &["store"]).await);

    let message = Message::broadcast("test", "embed", serde_json::json!({}));
    let results = registry
        .broadcast(&message, &"embed".into(), &RouteOptions::new())
        .await;
    assert_eq!(results.len(), 3);
    let ok: Vec<_> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, _)| id.as_str())
        .collect();
    assert_eq!(ok, vec!["a1", "a3"]);
}

// ===========================================================================
// Factory
// ===========================================================================

fn factory() -> (Arc<Registry>, AgentFactory) {
    let registry = Arc::new(Registry::default());
    let factory = AgentFactory::new(registry.clone(), RuntimeOptions::default());
    factory.register_template(
        AgentTemplate::new("embedder", "echo", |_, params| {
            if params.get("broken").is_some() {
                return Err("bad params".to_string());
            }
            Ok(Box::new(Echo {
                fail: false,
                delay: Duration::ZERO,
            }) as Box<dyn Agent>)
        })
        .capability(Capability::new("embed", "1")),
    );
    factory.register_template(
        AgentTemplate::new("flaky", "never-ready", |_, _| Ok(Box::new(NeverReady) as Box<dyn Agent>))
            .capability(Capability::new("search", "1")),
    );
    (registry, factory)
}

#[tokio::test]
async fn create_registers_a_ready_agent() {
    let (registry, factory) = factory();
    let handle = factory
        .create("embedder", Overrides::default().id("e1").capability(Capability::new("store", "1")))
        .await
        .unwrap();
    assert_eq!(handle.status(), AgentStatus::Idle);
    assert_eq!(ids(&registry.find_by_capability(&"embed".into())), vec!["e1"]);
    assert_eq!(ids(&registry.find_by_capability(&"store".into())), vec!["e1"]);
}

#[tokio::test]
async fn unknown_template_is_rejected() {
    let (_, factory) = factory();
    let err = factory.create("painter", Overrides::default()).await.unwrap_err();
    assert_eq!(err, FactoryError::UnknownTemplate("painter".into()));
}

#[tokio::test]
async fn failed_construction_leaves_nothing_registered() {
    let (registry, factory) = factory();
    let err = factory
        .create("embedder", Overrides::default().params(serde_json::json!({"broken": true})))
        .await
        .unwrap_err();
    assert!(matches!(err, FactoryError::InitializationFailed { .. }));

    let err = factory.create("flaky", Overrides::default().id("f1")).await.unwrap_err();
    assert!(matches!(err, FactoryError::InitializationFailed { .. }));
    assert!(registry.is_empty());
    assert!(registry.get(&"f1".into()).is_none());
}

#[tokio::test]
async fn scale_up_and_recreate() {
    let (registry, factory) = factory();
    let created = factory.scale_up(&"embed".into(), 3).await.unwrap();
    assert_eq!(created.len(), 3);
    assert_eq!(registry.eligible(&"embed".into()).len(), 3);

    let err = factory.scale_up(&"paint".into(), 1).await.unwrap_err();
    assert_eq!(err, FactoryError::NoTemplateForCapability("paint".into()));

    let victim = created[0].id().clone();
    let fresh = factory.recreate(&victim).await.unwrap();
    assert_eq!(fresh.id(), &victim);
    assert_eq!(fresh.status(), AgentStatus::Idle);
    assert_eq!(registry.eligible(&"embed".into()).len(), 3);
}

// ===========================================================================
// Health
// ===========================================================================

#[tokio::test]
async fn summary_counts_healthy_degraded_unreachable() {
    let registry = Arc::new(Registry::default());
    let healthy = agent("h", &["embed"]).await;
    let degraded = agent("d", &["embed"]).await;
    let down = agent("u", &["embed"]).await;
    degraded.set_performance(PerformanceSnapshot {
        error_rate: 0.6,
        processed: 5,
        ..Default::default()
    });
    down.shutdown().await;
    for a in [&healthy, &degraded, &down] {
        registry.register(a.clone());
    }

    let health = AgentHealth::new(registry.clone(), HealthConfig::default());
    let summary = health.summary();
    assert_eq!((summary.healthy, summary.degraded, summary.unreachable), (1, 1, 1));
    assert_eq!(summary.by_capability[&CapabilityKind::new("embed")].routable, 2);
    assert_eq!(health.report(&"d".into()).unwrap().state, HealthState::Degraded);
    assert!(health.report(&"missing".into()).is_none());
}

#[tokio::test]
async fn scaling_hint_feeds_factory() {
    let (registry, factory) = factory();
    let busy = factory.create("embedder", Overrides::default()).await.unwrap();
    let health = AgentHealth::new(registry.clone(), HealthConfig::default());
    assert!(health.scaling_hints(1).is_empty());

    let hint = ScalingHint {
        capability: "embed".into(),
        routable_agents: 1,
        total_load: 5,
    };
    assert_eq!(hint.additional_instances(2), 2);
    let added = factory.apply_hint(&hint, 2).await.unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(registry.eligible(&"embed".into()).len(), 3);
    assert!(busy.is_routable());
}

struct FixedCounts;

impl RecoveryCounts for FixedCounts {
    fn attempts_for_agent(&self, agent: &AgentId) -> u64 {
        if agent.as_str() == "h" {
            4
        } else {
            0
        }
    }
}

#[tokio::test]
async fn reports_include_recovery_attempts() {
    let registry = Arc::new(Registry::default());
    registry.register(agent("h", &["embed"]).await);
    let health = AgentHealth::new(registry, HealthConfig::default()).with_recovery(Arc::new(FixedCounts));
    assert_eq!(health.report(&"h".into()).unwrap().recovery_attempts, 4);
}

#[tokio::test]
async fn sampler_stops_on_cancel() {
    let registry = Arc::new(Registry::default());
    registry.register(agent("h", &["embed"]).await);
    let health = Arc::new(AgentHealth::new(
        registry,
        HealthConfig {
            sample_interval_ms: 10,
            ..Default::default()
        },
    ));
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = health.clone().spawn_sampler(cancel.clone());
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(health.latest().map(|s| s.healthy), Some(1));
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn zero_sample_interval_still_samples() {
    let registry = Arc::new(Registry::default());
    registry.register(agent("h", &["embed"]).await);
    let health = Arc::new(AgentHealth::new(
        registry,
        HealthConfig {
            sample_interval_ms: 0,
            ..Default::default()
        },
    ));
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = health.clone().spawn_sampler(cancel.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(health.latest().map(|s| s.healthy), Some(1));
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}
