//! Append-only record of recovery attempts with per-agent and per-kind
//! counters.

use crate::strategy::RecoveryAction;
use agentmesh_core::{AgentId, FailureKind, StepId};
use agentmesh_registry::RecoveryCounts;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Another attempt was scheduled with the given action.
    Scheduled(RecoveryAction),
    Escalated,
    /// Strategy said fail, or the attempt budget ran out.
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub agent: Option<AgentId>,
    pub step: Option<StepId>,
    pub kind: FailureKind,
    pub strategy: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
pub struct RecoveryLedger {
    attempts: RwLock<Vec<RecoveryAttempt>>,
    by_agent: DashMap<AgentId, u64>,
    by_kind: DashMap<FailureKind, u64>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, attempt: RecoveryAttempt) {
        if let Some(agent) = &attempt.agent {
            *self.by_agent.entry(agent.clone()).or_insert(0) += 1;
        }
        *self.by_kind.entry(attempt.kind).or_insert(0) += 1;
        self.attempts.write().push(attempt);
    }

    pub fn attempts(&self) -> Vec<RecoveryAttempt> {
        self.attempts.read().clone()
    }

    pub fn len(&self) -> usize {
        self.attempts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_kind(&self, kind: FailureKind) -> u64 {
        self.by_kind.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn by_kind(&self) -> BTreeMap<FailureKind, u64> {
        self.by_kind.iter().map(|e| (*e.key(), *e.value())).collect()
    }
}

impl RecoveryCounts for RecoveryLedger {
    fn attempts_for_agent(&self, agent: &AgentId) -> u64 {
        self.by_agent.get(agent).map(|c| *c).unwrap_or(0)
    }
}
