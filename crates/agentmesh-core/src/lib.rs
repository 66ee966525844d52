//! agentmesh core - identifiers, message envelope, capabilities, errors, config

pub mod capability;
pub mod config;
pub mod error;
pub mod types;

pub use capability::{Capability, CapabilitySet};
pub use config::MeshConfig;
pub use error::{
    AgentError, DispatchError, Error, ExecutionError, FactoryError, FailureKind, Result,
    RoutingError, StepError, StoreError, TransactionError, ValidationError,
};
pub use types::*;
