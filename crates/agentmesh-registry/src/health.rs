//! Agent health: per-agent reports, a system summary and scaling hints.
//!
//! Sampling only reads the performance snapshots the runtime maintains, so it
//! never contends with message routing.

use crate::registry::Registry;
use agentmesh_agent::AgentHandle;
use agentmesh_core::config::HealthConfig;
use agentmesh_core::{AgentId, AgentStatus, CapabilityKind};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source of recovery-attempt counts, implemented by the recovery ledger.
pub trait RecoveryCounts: Send + Sync {
    fn attempts_for_agent(&self, agent: &AgentId) -> u64;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub status: AgentStatus,
    pub state: HealthState,
    pub latency_ema_ms: f64,
    pub error_rate: f64,
    pub load: usize,
    pub processed: u64,
    pub failed: u64,
    pub recovery_attempts: u64,
    pub capabilities: Vec<CapabilityKind>,
    pub sampled_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityLoad {
    pub agents: usize,
    pub routable: usize,
    pub total_load: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unreachable: usize,
    pub by_capability: BTreeMap<CapabilityKind, CapabilityLoad>,
    pub sampled_at: DateTime<Utc>,
}

impl HealthSummary {
    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.unreachable
    }
}

/// Observed load for one capability, consumed by the factory's scaling hook.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalingHint {
    pub capability: CapabilityKind,
    pub routable_agents: usize,
    pub total_load: usize,
}

impl ScalingHint {
    /// Instances needed so that each carries at most `per_agent_load`.
    pub fn additional_instances(&self, per_agent_load: usize) -> usize {
        let per_agent = per_agent_load.max(1);
        let wanted = self.total_load.div_ceil(per_agent);
        wanted.saturating_sub(self.routable_agents)
    }
}

pub struct AgentHealth {
    registry: Arc<Registry>,
    config: HealthConfig,
    recovery: Option<Arc<dyn RecoveryCounts>>,
    latest: RwLock<Option<HealthSummary>>,
}

impl AgentHealth {
    pub fn new(registry: Arc<Registry>, config: HealthConfig) -> Self {
        Self {
            registry,
            config,
            recovery: None,
            latest: RwLock::new(None),
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<dyn RecoveryCounts>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    fn classify(&self, status: AgentStatus, error_rate: f64, latency_ms: f64) -> HealthState {
        if !status.is_routable() {
            HealthState::Unreachable
        } else if error_rate >= self.config.degraded_error_rate
            || latency_ms >= self.config.degraded_latency_ms
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn sample_agent(&self, agent: &AgentHandle) -> HealthReport {
        let perf = agent.performance();
        let status = agent.status();
        HealthReport {
            agent_id: agent.id().clone(),
            agent_type: agent.agent_type().to_string(),
            status,
            state: self.classify(status, perf.error_rate, perf.latency_ema_ms),
            latency_ema_ms: perf.latency_ema_ms,
            error_rate: perf.error_rate,
            load: perf.load,
            processed: perf.processed,
            failed: perf.failed,
            recovery_attempts: self
                .recovery
                .as_ref()
                .map(|r| r.attempts_for_agent(agent.id()))
                .unwrap_or_default(),
            capabilities: agent.capabilities().kinds(),
            sampled_at: Utc::now(),
        }
    }

    pub fn report(&self, agent_id: &AgentId) -> Option<HealthReport> {
        self.registry.get(agent_id).map(|a| self.sample_agent(&a))
    }

    pub fn reports(&self) -> Vec<HealthReport> {
        self.registry
            .agents()
            .iter()
            .map(|a| self.sample_agent(a))
            .collect()
    }

    pub fn summary(&self) -> HealthSummary {
        let mut summary = HealthSummary {
            healthy: 0,
            degraded: 0,
            unreachable: 0,
            by_capability: BTreeMap::new(),
            sampled_at: Utc::now(),
        };
        for report in self.reports() {
            match report.state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Unreachable => summary.unreachable += 1,
            }
            for kind in &report.capabilities {
                let entry = summary.by_capability.entry(kind.clone()).or_default();
                entry.agents += 1;
                entry.total_load += report.load;
                if report.state != HealthState::Unreachable {
                    entry.routable += 1;
                }
            }
        }
        *self.latest.write() = Some(summary.clone());
        summary
    }

    /// Most recent summary produced by `summary()` or the sampler.
    pub fn latest(&self) -> Option<HealthSummary> {
        self.latest.read().clone()
    }

    /// Capabilities whose load per routable agent reaches `per_agent_load`.
    pub fn scaling_hints(&self, per_agent_load: usize) -> Vec<ScalingHint> {
        self.summary()
            .by_capability
            .into_iter()
            .map(|(capability, load)| ScalingHint {
                capability,
                routable_agents: load.routable,
                total_load: load.total_load,
            })
            .filter(|hint| hint.additional_instances(per_agent_load) > 0)
            .collect()
    }

    /// Sample periodically until `cancel` fires.
    pub fn spawn_sampler(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.config.sample_interval();
        tokio::spawn(async move {
            info!("health sampler started ({}ms)", interval.as_millis());
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = self.summary();
                        if summary.unreachable > 0 || summary.degraded > 0 {
                            warn!(
                                "health: {} healthy, {} degraded, {} unreachable",
                                summary.healthy, summary.degraded, summary.unreachable
                            );
                        } else {
                            debug!("health: {} healthy", summary.healthy);
                        }
                    }
                }
            }
            info!("health sampler stopped");
        })
    }
}
