//! Turns a failure into a decision, records it, and publishes escalations.

use crate::ledger::{AttemptOutcome, RecoveryAttempt, RecoveryLedger};
use crate::strategy::{Failure, RecoveryAction, StrategyFactory};
use agentmesh_core::config::RecoveryConfig;
use agentmesh_core::{AgentId, FailureKind, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const ESCALATION_CAPACITY: usize = 64;

/// Supervisor notification for a failure automated recovery will not handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub agent: Option<AgentId>,
    pub step: Option<StepId>,
    pub kind: FailureKind,
    pub strategy: String,
    pub attempts: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Reroute { delay: Duration },
    Recreate { delay: Duration },
    Escalate,
    GiveUp,
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Escalate | Self::GiveUp)
    }

    pub fn delay(&self) -> Duration {
        match self {
            Self::Retry { delay } | Self::Reroute { delay } | Self::Recreate { delay } => *delay,
            Self::Escalate | Self::GiveUp => Duration::ZERO,
        }
    }
}

pub struct Recovery {
    strategies: StrategyFactory,
    ledger: Arc<RecoveryLedger>,
    escalations: broadcast::Sender<Escalation>,
}

impl Recovery {
    pub fn new(strategies: StrategyFactory) -> Self {
        let (escalations, _) = broadcast::channel(ESCALATION_CAPACITY);
        Self {
            strategies,
            ledger: Arc::new(RecoveryLedger::new()),
            escalations,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(StrategyFactory::from_config(config))
    }

    pub fn ledger(&self) -> Arc<RecoveryLedger> {
        self.ledger.clone()
    }

    /// Supervisor end of the escalation channel.
    pub fn subscribe(&self) -> broadcast::Receiver<Escalation> {
        self.escalations.subscribe()
    }

    /// Pick a strategy for `failure` and decide the next step. Every call is
    /// recorded in the ledger.
    pub fn decide(&self, failure: &Failure) -> Decision {
        let strategy = self.strategies.select(failure);
        let exhausted = failure.attempt >= strategy.max_attempts;

        let decision = if exhausted {
            if strategy.escalate_on_exhaustion {
                Decision::Escalate
            } else {
                Decision::GiveUp
            }
        } else {
            let delay = strategy.backoff.delay(failure.attempt);
            match strategy.action {
                RecoveryAction::RetryInPlace => Decision::Retry { delay },
                RecoveryAction::Reroute => Decision::Reroute { delay },
                RecoveryAction::Recreate => Decision::Recreate { delay },
                RecoveryAction::Escalate => Decision::Escalate,
                RecoveryAction::Fail => Decision::GiveUp,
            }
        };

        let outcome = match &decision {
            Decision::Retry { .. } => AttemptOutcome::Scheduled(RecoveryAction::RetryInPlace),
            Decision::Reroute { .. } => AttemptOutcome::Scheduled(RecoveryAction::Reroute),
            Decision::Recreate { .. } => AttemptOutcome::Scheduled(RecoveryAction::Recreate),
            Decision::Escalate => AttemptOutcome::Escalated,
            Decision::GiveUp => AttemptOutcome::GaveUp,
        };
        self.ledger.record(RecoveryAttempt {
            agent: failure.agent.clone(),
            step: failure.step.clone(),
            kind: failure.kind,
            strategy: strategy.name.clone(),
            attempt: failure.attempt,
            outcome,
            at: Utc::now(),
        });

        match &decision {
            Decision::GiveUp => warn!(
                "recovery[{}]: giving up on {} after {} attempt(s): {}",
                strategy.name, failure.kind, failure.attempt, failure.error
            ),
            Decision::Escalate => {
                warn!(
                    "recovery[{}]: escalating {} after {} attempt(s): {}",
                    strategy.name, failure.kind, failure.attempt, failure.error
                );
                let escalation = Escalation {
                    agent: failure.agent.clone(),
                    step: failure.step.clone(),
                    kind: failure.kind,
                    strategy: strategy.name.clone(),
                    attempts: failure.attempt,
                    reason: failure.error.to_string(),
                    at: Utc::now(),
                };
                if self.escalations.send(escalation).is_err() {
                    warn!("recovery: no supervisor subscribed to escalations");
                }
            }
            other => info!(
                "recovery[{}]: {} on attempt {}, next in {}ms ({:?})",
                strategy.name,
                failure.kind,
                failure.attempt,
                other.delay().as_millis(),
                strategy.action
            ),
        }
        decision
    }
}
