//! Per-run undo log against the triple store.
//!
//! Each committed mutation contributes the receipt of what it actually
//! changed. A mutation is first logged as a pending intent (the inserts it
//! will make that are not already present) before it is sent to the store,
//! so an update that lands without its receipt ever arriving is still undone.
//! Rollback folds the whole log into the single update that returns
//! every touched fact to its state before the run, and applies it once, so
//! either all of the run's mutations disappear or none do.

use agentmesh_core::{RunId, StepId, TransactionError};
use agentmesh_kg::{Triple, TripleStore, Update, UpdateReceipt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Committed => write!(f, "committed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UndoEntry {
    pub step: Option<StepId>,
    pub description: String,
    pub receipt: UpdateReceipt,
    /// Logged before the store confirmed it; `receipt` is the intent.
    #[serde(default)]
    pub pending: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Transaction {
    pub run_id: RunId,
    pub state: TransactionState,
    pub undo: Vec<UndoEntry>,
}

impl Transaction {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            state: TransactionState::Open,
            undo: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TransactionState::Open
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransactionError::NotOpen {
                run_id: self.run_id.clone(),
                state: self.state.to_string(),
            })
        }
    }

    /// Record an applied mutation. Receipts that changed nothing are dropped.
    pub fn record(
        &mut self,
        step: Option<StepId>,
        description: impl Into<String>,
        receipt: UpdateReceipt,
    ) -> Result<(), TransactionError> {
        self.ensure_open()?;
        if !receipt.is_noop() {
            self.undo.push(UndoEntry {
                step,
                description: description.into(),
                receipt,
                pending: false,
            });
        }
        Ok(())
    }

    /// Log a mutation before applying it. Returns the slot to settle once the
    /// store answers; an unsettled intent is undone like any other entry.
    pub fn record_intent(
        &mut self,
        step: Option<StepId>,
        description: impl Into<String>,
        intent: UpdateReceipt,
    ) -> Result<usize, TransactionError> {
        self.ensure_open()?;
        self.undo.push(UndoEntry {
            step,
            description: description.into(),
            receipt: intent,
            pending: true,
        });
        Ok(self.undo.len() - 1)
    }

    /// Replace a pending intent with the receipt the store returned.
    pub fn settle(&mut self, slot: usize, receipt: UpdateReceipt) -> Result<(), TransactionError> {
        self.ensure_open()?;
        if let Some(entry) = self.undo.get_mut(slot).filter(|e| e.pending) {
            entry.receipt = receipt;
            entry.pending = false;
        }
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.undo.iter().filter(|e| e.pending).count()
    }

    /// Make every recorded mutation permanent and discard the undo log.
    pub fn commit(&mut self) -> Result<usize, TransactionError> {
        self.ensure_open()?;
        let entries = self.undo.len();
        self.undo.clear();
        self.state = TransactionState::Committed;
        info!("run {} committed ({} mutations)", self.run_id, entries);
        Ok(entries)
    }

    /// The single update that restores every fact this run touched.
    pub fn restoring_update(&self) -> Update {
        // triple -> (present before the run, present now)
        let mut seen: HashMap<Triple, (bool, bool)> = HashMap::new();
        let mut order = Vec::new();
        for entry in &self.undo {
            for t in &entry.receipt.removed {
                seen.entry(t.clone())
                    .and_modify(|s| s.1 = false)
                    .or_insert_with(|| {
                        order.push(t.clone());
                        (true, false)
                    });
            }
            for t in &entry.receipt.inserted {
                seen.entry(t.clone())
                    .and_modify(|s| s.1 = true)
                    .or_insert_with(|| {
                        order.push(t.clone());
                        (false, true)
                    });
            }
        }
        let mut update = Update::new();
        for t in order {
            match seen.get(&t) {
                Some((true, false)) => update.insert.push(t),
                Some((false, true)) => update.remove.push(t),
                _ => {}
            }
        }
        update
    }

    /// Undo every recorded mutation. Any failure is terminal for the run.
    pub async fn rollback(
        &mut self,
        store: &dyn TripleStore,
        timeout: Option<Duration>,
    ) -> Result<usize, TransactionError> {
        self.ensure_open()?;
        let update = self.restoring_update();
        info!(
            "rolling back run {}: {} entries, {} inserts, {} removals",
            self.run_id,
            self.undo.len(),
            update.insert.len(),
            update.remove.len()
        );
        if !update.is_empty() {
            if let Err(e) = store.apply_update(&update, timeout).await {
                self.state = TransactionState::RollbackFailed;
                error!("rollback of run {} failed: {}", self.run_id, e);
                return Err(TransactionError::RollbackFailed {
                    run_id: self.run_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        let entries = self.undo.len();
        self.undo.clear();
        self.state = TransactionState::RolledBack;
        Ok(entries)
    }
}
