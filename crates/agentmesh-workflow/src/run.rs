//! Run state, persisted as a versioned snapshot, and the status report
//! derived from it.

use crate::transaction::{Transaction, TransactionState};
use agentmesh_core::{AgentId, RunId, StepError, StepId, TransactionError, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Committed,
    RolledBack,
    Cancelled,
    /// Rollback itself failed; automated recovery has stopped.
    RollbackFailed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    pub attempts: u32,
    pub agent: Option<AgentId>,
    #[serde(default)]
    pub output: serde_json::Value,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            agent: None,
            output: serde_json::Value::Null,
            started: None,
            ended: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunState {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version: u64,
    /// Bumped on every persisted snapshot.
    pub version: u64,
    pub status: RunStatus,
    pub steps: BTreeMap<StepId, StepState>,
    /// Every step error in the order observed; the first one caused the
    /// rollback.
    pub errors: Vec<StepError>,
    pub rollback_error: Option<TransactionError>,
    pub transaction: Transaction,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

impl RunState {
    pub fn new(run_id: RunId, workflow_id: WorkflowId, workflow_version: u64, steps: impl IntoIterator<Item = StepId>) -> Self {
        Self {
            transaction: Transaction::new(run_id.clone()),
            run_id,
            workflow_id,
            workflow_version,
            version: 0,
            status: RunStatus::Running,
            steps: steps.into_iter().map(|s| (s, StepState::default())).collect(),
            errors: Vec::new(),
            rollback_error: None,
            started: Utc::now(),
            ended: None,
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&StepState> {
        self.steps.get(id)
    }

    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut StepState> {
        self.steps.get_mut(id)
    }

    pub fn set_status(&mut self, id: &StepId, status: StepStatus) {
        if let Some(step) = self.steps.get_mut(id) {
            step.status = status;
            match status {
                StepStatus::Running => step.started = Some(Utc::now()),
                StepStatus::Pending => {}
                _ => step.ended = Some(Utc::now()),
            }
        }
    }

    /// Steps left Running by an interrupted process go back to Pending.
    pub fn reset_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for step in self.steps.values_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                step.started = None;
                reset += 1;
            }
        }
        reset
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended = Some(Utc::now());
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            steps: self.steps.iter().map(|(id, s)| (id.clone(), s.status)).collect(),
            error_chain: self.errors.clone(),
            rollback_error: self.rollback_error.clone(),
            transaction: self.transaction.state,
            version: self.version,
        }
    }
}

/// Answer to a run status query.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub status: RunStatus,
    pub steps: BTreeMap<StepId, StepStatus>,
    /// Full chain of step errors, originating failure first.
    pub error_chain: Vec<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<TransactionError>,
    pub transaction: TransactionState,
    pub version: u64,
}

impl RunReport {
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| **s == status).count()
    }
}
