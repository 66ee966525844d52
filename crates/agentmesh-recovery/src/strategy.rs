//! Recovery strategies and the ordered-predicate factory that picks one.

use crate::backoff::Backoff;
use agentmesh_core::config::RecoveryConfig;
use agentmesh_core::{AgentId, CapabilityKind, DispatchError, FailureKind, StepId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What to do before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Try the same agent again.
    RetryInPlace,
    /// Try a different eligible agent.
    Reroute,
    /// Discard the agent, build a fresh one from its template, then retry.
    Recreate,
    /// Hand the failure to a supervisor and stop.
    Escalate,
    /// Log and stop.
    Fail,
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RetryInPlace => "retry_in_place",
            Self::Reroute => "reroute",
            Self::Recreate => "recreate",
            Self::Escalate => "escalate",
            Self::Fail => "fail",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub name: String,
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub action: RecoveryAction,
    /// Publish an escalation when the attempt budget runs out.
    #[serde(default)]
    pub escalate_on_exhaustion: bool,
}

impl RecoveryStrategy {
    pub fn new(name: impl Into<String>, max_attempts: u32, backoff: Backoff, action: RecoveryAction) -> Self {
        Self {
            name: name.into(),
            max_attempts: max_attempts.max(1),
            backoff,
            action,
            escalate_on_exhaustion: false,
        }
    }

    pub fn escalating(mut self) -> Self {
        self.escalate_on_exhaustion = true;
        self
    }

    /// Log-and-fail fallback for failures no rule matches.
    pub fn log_and_fail() -> Self {
        Self::new("default", 1, Backoff::None, RecoveryAction::Fail)
    }
}

/// One observed failure, as seen by strategy predicates.
#[derive(Debug, Clone)]
pub struct Failure {
    pub kind: FailureKind,
    pub error: DispatchError,
    /// Agent that produced the failure, if the delivery reached one.
    pub agent: Option<AgentId>,
    pub capability: Option<CapabilityKind>,
    pub step: Option<StepId>,
    /// Attempts made so far, including the one that just failed.
    pub attempt: u32,
}

impl Failure {
    pub fn new(error: DispatchError, attempt: u32) -> Self {
        Self {
            kind: error.failure_kind(),
            error,
            agent: None,
            capability: None,
            step: None,
            attempt,
        }
    }

    pub fn agent(mut self, agent: Option<AgentId>) -> Self {
        self.agent = agent;
        self
    }

    pub fn capability(mut self, capability: CapabilityKind) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn step(mut self, step: StepId) -> Self {
        self.step = Some(step);
        self
    }
}

pub type Predicate = Arc<dyn Fn(&Failure) -> bool + Send + Sync>;

/// Matches a failure against rules in order; the first match wins.
#[derive(Clone)]
pub struct StrategyFactory {
    rules: Vec<(Predicate, Arc<RecoveryStrategy>)>,
    fallback: Arc<RecoveryStrategy>,
}

impl Default for StrategyFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyFactory {
    /// No rules: everything falls back to log-and-fail.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Arc::new(RecoveryStrategy::log_and_fail()),
        }
    }

    /// One rule per recoverable failure kind, in taxonomy order.
    pub fn from_config(config: &RecoveryConfig) -> Self {
        let backoff = Backoff::exponential(config.base_delay_ms, config.max_delay_ms, config.jitter_ratio);
        Self::new()
            .for_kind(
                FailureKind::Timeout,
                RecoveryStrategy::new("timeout", config.timeout_max_attempts, backoff.clone(), RecoveryAction::RetryInPlace),
            )
            .for_kind(
                FailureKind::ResourceExhaustion,
                RecoveryStrategy::new(
                    "resource_exhaustion",
                    config.resource_exhaustion_max_attempts,
                    backoff.clone(),
                    RecoveryAction::Reroute,
                ),
            )
            .for_kind(
                FailureKind::CommunicationFailure,
                RecoveryStrategy::new(
                    "communication_failure",
                    config.communication_max_attempts,
                    backoff.clone(),
                    RecoveryAction::Reroute,
                ),
            )
            .for_kind(
                FailureKind::StateCorruption,
                RecoveryStrategy::new(
                    "state_corruption",
                    config.state_corruption_max_attempts,
                    backoff,
                    RecoveryAction::Recreate,
                )
                .escalating(),
            )
    }

    /// Append a rule.
    pub fn rule<F>(mut self, predicate: F, strategy: RecoveryStrategy) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.rules.push((Arc::new(predicate), Arc::new(strategy)));
        self
    }

    /// Insert a rule ahead of every existing one.
    pub fn rule_first<F>(mut self, predicate: F, strategy: RecoveryStrategy) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(0, (Arc::new(predicate), Arc::new(strategy)));
        self
    }

    pub fn for_kind(self, kind: FailureKind, strategy: RecoveryStrategy) -> Self {
        self.rule(move |f| f.kind == kind, strategy)
    }

    pub fn fallback(mut self, strategy: RecoveryStrategy) -> Self {
        self.fallback = Arc::new(strategy);
        self
    }

    pub fn select(&self, failure: &Failure) -> Arc<RecoveryStrategy> {
        self.rules
            .iter()
            .find(|(predicate, _)| predicate(failure))
            .map(|(_, strategy)| strategy.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}
