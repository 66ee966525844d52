//! The polymorphic agent contract.
//!
//! Implementations only provide `handle`; status bookkeeping, diary entries
//! and latency measurement are added uniformly by [`crate::AgentHandle`].

use agentmesh_core::{AgentId, ExecutionError, Message};
use tokio_util::sync::CancellationToken;

/// Per-delivery context handed to [`Agent::handle`].
#[derive(Clone, Debug)]
pub struct HandlerContext {
    pub agent_id: AgentId,
    /// Cancelled when the caller gives up (deadline or run cancellation).
    pub cancel: CancellationToken,
}

#[async_trait::async_trait]
pub trait Agent: Send + 'static {
    /// Type tag, e.g. the template name.
    fn agent_type(&self) -> &str;

    async fn initialize(&mut self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Process one message and produce exactly one reply.
    async fn handle(&mut self, ctx: &HandlerContext, message: Message) -> Result<Message, ExecutionError>;

    async fn shutdown(&mut self) {}
}
