//! agentmesh-registry - capability registry, agent factory and agent health

pub mod factory;
pub mod health;
pub mod registry;
pub mod strategy;

pub use factory::{AgentFactory, AgentTemplate, Constructor, Overrides};
pub use health::{
    AgentHealth, CapabilityLoad, HealthReport, HealthState, HealthSummary, RecoveryCounts,
    ScalingHint,
};
pub use registry::{Registry, RouteOptions, Routed};
pub use strategy::{PerformanceBased, RoundRobin, SelectionStrategy};
