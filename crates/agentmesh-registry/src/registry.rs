//! Capability registry: discovery, routing and broadcast over running agents.
//!
//! The registry is an explicit object passed by reference; there is no global
//! instance. It never retries a failed delivery. Retry and re-route decisions
//! belong to the caller (workflow manager, recovery).

use crate::strategy::{PerformanceBased, RoundRobin, SelectionStrategy};
use agentmesh_agent::AgentHandle;
use agentmesh_core::config::{RoutingConfig, StrategyName};
use agentmesh_core::{
    AgentError, AgentId, AgentStatus, CapabilityKind, CapabilitySet, DispatchError, ExecutionError,
    Message, RoutingError,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call routing parameters.
#[derive(Clone, Default)]
pub struct RouteOptions {
    /// Overrides the registry's default strategy.
    pub strategy: Option<Arc<dyn SelectionStrategy>>,
    /// Agents that must not be selected (used for re-routing).
    pub exclude: Vec<AgentId>,
    /// Overrides the registry's dispatch timeout.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn exclude(mut self, agents: impl IntoIterator<Item = AgentId>) -> Self {
        self.exclude.extend(agents);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A successful delivery and who handled it.
#[derive(Clone, Debug)]
pub struct Routed {
    pub agent_id: AgentId,
    pub reply: Message,
}

pub struct Registry {
    agents: DashMap<AgentId, AgentHandle>,
    /// capability -> holders in registration order
    index: RwLock<HashMap<CapabilityKind, Vec<AgentId>>>,
    round_robin: Arc<RoundRobin>,
    performance: Arc<PerformanceBased>,
    default_strategy: StrategyName,
    dispatch_timeout: Duration,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&RoutingConfig::default())
    }
}

impl Registry {
    pub fn new(config: &RoutingConfig) -> Self {
        Self {
            agents: DashMap::new(),
            index: RwLock::new(HashMap::new()),
            round_robin: Arc::new(RoundRobin::new()),
            performance: Arc::new(PerformanceBased::new()),
            default_strategy: config.default_strategy,
            dispatch_timeout: config.dispatch_timeout(),
        }
    }

    /// Shared instance of a named strategy (rotation state is kept per registry).
    pub fn strategy(&self, name: StrategyName) -> Arc<dyn SelectionStrategy> {
        match name {
            StrategyName::RoundRobin => self.round_robin.clone(),
            StrategyName::PerformanceBased => self.performance.clone(),
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.dispatch_timeout
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Register `agent` under every capability it holds. Registering the same
    /// id again replaces the handle and re-indexes without duplicating entries.
    pub fn register(&self, agent: AgentHandle) {
        let id = agent.id().clone();
        let kinds = agent.capabilities().kinds();
        self.agents.insert(id.clone(), agent);
        let mut index = self.index.write();
        for (kind, holders) in index.iter_mut() {
            if !kinds.contains(kind) {
                holders.retain(|h| *h != id);
            }
        }
        index.retain(|_, holders| !holders.is_empty());
        for kind in &kinds {
            let holders = index.entry(kind.clone()).or_default();
            if !holders.contains(&id) {
                holders.push(id.clone());
            }
        }
        info!("registered agent {} for {:?}", id, kinds.iter().map(|k| k.as_str()).collect::<Vec<_>>());
    }

    /// Apply `capabilities` to the agent (same-kind replacement, atomic per
    /// capability) and register it.
    pub fn register_with(&self, agent: AgentHandle, capabilities: CapabilitySet) -> Result<(), AgentError> {
        for cap in capabilities.iter() {
            agent.add_capability(cap.clone())?;
        }
        self.register(agent);
        Ok(())
    }

    pub fn deregister(&self, id: &AgentId) -> Option<AgentHandle> {
        let (_, handle) = self.agents.remove(id)?;
        let mut index = self.index.write();
        for holders in index.values_mut() {
            holders.retain(|h| h != id);
        }
        index.retain(|_, holders| !holders.is_empty());
        info!("deregistered agent {}", id);
        Some(handle)
    }

    /// Re-read an agent's capability set after it changed.
    pub fn refresh(&self, id: &AgentId) -> bool {
        match self.get(id) {
            Some(handle) => {
                self.register(handle);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.get(id).map(|h| h.clone())
    }

    pub fn agents(&self) -> Vec<AgentHandle> {
        let mut all: Vec<AgentHandle> = self.agents.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn capabilities(&self) -> Vec<CapabilityKind> {
        let mut kinds: Vec<_> = self.index.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Every registered holder of `kind`, in registration order.
    pub fn find_by_capability(&self, kind: &CapabilityKind) -> Vec<AgentHandle> {
        let ids = self.index.read().get(kind).cloned().unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Holders of `kind` that can currently accept a delivery.
    pub fn eligible(&self, kind: &CapabilityKind) -> Vec<AgentHandle> {
        self.find_by_capability(kind)
            .into_iter()
            .filter(|a| a.is_routable())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Pick one eligible holder of `capability` without delivering to it.
    pub fn select(&self, capability: &CapabilityKind, options: &RouteOptions) -> Result<AgentHandle, RoutingError> {
        let candidates: Vec<AgentHandle> = self
            .eligible(capability)
            .into_iter()
            .filter(|a| !options.exclude.contains(a.id()))
            .collect();
        let strategy = options
            .strategy
            .clone()
            .unwrap_or_else(|| self.strategy(self.default_strategy));
        strategy
            .select(capability, &candidates)
            .and_then(|i| candidates.get(i).cloned())
            .ok_or_else(|| {
                debug!("no eligible agent for {} ({})", capability, strategy.name());
                RoutingError::NoEligibleAgent(capability.clone())
            })
    }

    /// Deliver `message` to exactly one eligible holder of `capability`.
    pub async fn route(
        &self,
        message: &Message,
        capability: &CapabilityKind,
        options: &RouteOptions,
    ) -> Result<Routed, DispatchError> {
        let chosen = self.select(capability, options)?;
        debug!("routing {} for {} to {}", message.id, capability, chosen.id());
        self.dispatch(&chosen, message, options).await
    }

    /// Deliver to one specific agent.
    pub async fn route_to(
        &self,
        agent_id: &AgentId,
        message: &Message,
        options: &RouteOptions,
    ) -> Result<Routed, DispatchError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| RoutingError::AgentUnavailable(agent_id.clone()))?;
        self.dispatch(&agent, message, options).await
    }

    /// Best-effort delivery to every eligible holder; one result per agent.
    pub async fn broadcast(
        &self,
        message: &Message,
        capability: &CapabilityKind,
        options: &RouteOptions,
    ) -> Vec<(AgentId, Result<Message, DispatchError>)> {
        let targets = self.eligible(capability);
        let deliveries = targets.iter().map(|agent| async move {
            let result = self.dispatch(agent, message, options).await.map(|r| r.reply);
            (agent.id().clone(), result)
        });
        let results = futures::future::join_all(deliveries).await;
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!("broadcast {} to {}: {} of {} deliveries failed", message.id, capability, failed, results.len());
        }
        results
    }

    async fn dispatch(
        &self,
        agent: &AgentHandle,
        message: &Message,
        options: &RouteOptions,
    ) -> Result<Routed, DispatchError> {
        let id = agent.id().clone();
        if self.is_gone(agent) {
            warn!("agent {} unavailable", id);
            return Err(RoutingError::AgentUnavailable(id).into());
        }
        let timeout = options.timeout.unwrap_or(self.dispatch_timeout);
        let addressed = message.addressed_to(&id);
        match agent.send(addressed, Some(timeout), &options.cancel).await {
            Ok(reply) => Ok(Routed { agent_id: id, reply }),
            // the agent went away while the delivery was queued
            Err(ExecutionError::CommunicationFailure(_)) if self.is_gone(agent) => {
                Err(RoutingError::AgentUnavailable(id).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_gone(&self, agent: &AgentHandle) -> bool {
        !self.agents.contains_key(agent.id())
            || matches!(agent.status(), AgentStatus::Terminated | AgentStatus::ShuttingDown)
    }
}
