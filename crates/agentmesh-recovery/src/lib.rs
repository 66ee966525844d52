//! agentmesh-recovery - failure classification and remedial strategies

pub mod backoff;
pub mod ledger;
pub mod recovery;
pub mod strategy;

pub use backoff::Backoff;
pub use ledger::{AttemptOutcome, RecoveryAttempt, RecoveryLedger};
pub use recovery::{Decision, Escalation, Recovery};
pub use strategy::{Failure, Predicate, RecoveryAction, RecoveryStrategy, StrategyFactory};
