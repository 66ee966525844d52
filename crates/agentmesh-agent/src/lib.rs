//! agentmesh-agent - agent contract and runtime wrapper

pub mod agent;
pub mod diary;
pub mod performance;
pub mod remote;
pub mod runtime;

pub use agent::{Agent, HandlerContext};
pub use diary::{agent_iri, Diary, DiaryEntry, DiaryKind, DIARY_ENTRY_CLASS};
pub use performance::{PerformanceSnapshot, EMA_ALPHA};
pub use remote::RemoteAgent;
pub use runtime::{AgentHandle, RuntimeOptions};
