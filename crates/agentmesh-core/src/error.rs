//! Error taxonomy for agentmesh

use crate::types::{AgentId, AgentStatus, CapabilityKind, RunId, StepId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification consumed by the recovery subsystem.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ResourceExhaustion,
    CommunicationFailure,
    StateCorruption,
    Application,
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::CommunicationFailure => "communication_failure",
            Self::StateCorruption => "state_corruption",
            Self::Application => "application",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A submission-time workflow violation. Reported in full, never just the first.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("cycle detected: {}", join_steps(.path))]
    Cycle { path: Vec<StepId> },

    #[error("step {step} references undeclared step {reference}")]
    UnknownStepReference { step: StepId, reference: StepId },

    #[error("step {step} requires capability {capability} but no agent is eligible")]
    NoEligibleAgent { step: StepId, capability: CapabilityKind },

    #[error("step {step} is declared more than once")]
    DuplicateStep { step: StepId },

    #[error("step {step} binds input {input} from {from_step}, which is not a predecessor")]
    UnboundInput {
        step: StepId,
        input: String,
        from_step: StepId,
    },

    #[error("concurrency limit must be at least 1")]
    InvalidConcurrencyLimit,
}

fn join_steps(path: &[StepId]) -> String {
    path.iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Raised per dispatch attempt. The registry never retries on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingError {
    #[error("agent unavailable: {0}")]
    AgentUnavailable(AgentId),

    #[error("no eligible agent for capability {0}")]
    NoEligibleAgent(CapabilityKind),
}

/// Raised while executing a step; handed to recovery first.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("timed out after {elapsed_ms}ms: {context}")]
    Timeout { context: String, elapsed_ms: u64 },

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("communication failure: {0}")]
    CommunicationFailure(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ExecutionError {
    pub fn timeout(context: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            context: context.into(),
            elapsed_ms,
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::ResourceExhaustion(_) => FailureKind::ResourceExhaustion,
            Self::CommunicationFailure(_) => FailureKind::CommunicationFailure,
            Self::StateCorruption(_) => FailureKind::StateCorruption,
            Self::Application(_) => FailureKind::Application,
            Self::Cancelled(_) => FailureKind::Cancelled,
        }
    }
}

/// Outcome of a single dispatch: either routing failed or the agent did.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl DispatchError {
    /// Routing failures are classified as the failure kind they most
    /// resemble so recovery can pick a strategy for them.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Routing(RoutingError::AgentUnavailable(_)) => FailureKind::CommunicationFailure,
            Self::Routing(RoutingError::NoEligibleAgent(_)) => FailureKind::ResourceExhaustion,
            Self::Execution(e) => e.kind(),
        }
    }
}

/// Fatal: never auto-retried, surfaced to an operator.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionError {
    #[error("rollback of run {run_id} failed: {reason}")]
    RollbackFailed { run_id: RunId, reason: String },

    #[error("transaction for run {run_id} is not open ({state})")]
    NotOpen { run_id: RunId, state: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent {agent}: invalid state transition {from} -> {to}")]
    InvalidStateTransition {
        agent: AgentId,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[error("capability {capability} depends on missing capability {missing}")]
    MissingDependency {
        capability: CapabilityKind,
        missing: CapabilityKind,
    },

    #[error("capability {capability} conflicts with held capability {existing}")]
    CapabilityConflict {
        capability: CapabilityKind,
        existing: CapabilityKind,
    },

    #[error("capability {capability} is required by {dependent}")]
    RequiredByDependent {
        capability: CapabilityKind,
        dependent: CapabilityKind,
    },

    #[error("capability {0} is not held")]
    CapabilityNotHeld(CapabilityKind),

    #[error("mailbox closed for agent {0}")]
    MailboxClosed(AgentId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),

    #[error("template {template} failed to initialize: {reason}")]
    InitializationFailed { template: String, reason: String },

    #[error("no template provides capability {0}")]
    NoTemplateForCapability(CapabilityKind),
}

impl FactoryError {
    pub fn initialization_failed(template: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            template: template.into(),
            reason: reason.into(),
        }
    }
}

/// Triple store failures. `Network` and `Protocol` are only produced by
/// remote backends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("query parse error at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn parse(position: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            position,
            message: message.into(),
        }
    }
}

/// Step-level error recorded in run status.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("step {step} attempt {attempt}: {error}")]
pub struct StepError {
    pub step: StepId,
    pub attempt: u32,
    pub error: DispatchError,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {} violation(s)", .0.len())]
    Validation(Vec<ValidationError>),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<DispatchError> for Error {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Routing(r) => Self::Routing(r),
            DispatchError::Execution(x) => Self::Execution(x),
        }
    }
}

impl Error {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
