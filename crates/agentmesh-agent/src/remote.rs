//! Adapter for an agent hosted behind an HTTP endpoint.
//!
//! The endpoint receives the message envelope as JSON and answers with the
//! reply envelope. Wrapped in an [`crate::AgentHandle`] like any local agent,
//! so it gets the same deadline and cancellation path.

use crate::agent::{Agent, HandlerContext};
use agentmesh_core::{ExecutionError, Message, MessageKind};
use reqwest::{Client, StatusCode};
use tracing::debug;

pub struct RemoteAgent {
    client: Client,
    endpoint: String,
    agent_type: String,
}

impl RemoteAgent {
    pub fn new(agent_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn transport_error(e: reqwest::Error) -> ExecutionError {
    if e.is_timeout() {
        ExecutionError::timeout(format!("remote agent: {}", e), 0)
    } else {
        ExecutionError::CommunicationFailure(e.to_string())
    }
}

#[async_trait::async_trait]
impl Agent for RemoteAgent {
    fn agent_type(&self) -> &str {
        &self.agent_type
    }

    async fn handle(&mut self, ctx: &HandlerContext, message: Message) -> Result<Message, ExecutionError> {
        debug!("agent {}: forwarding {} to {}", ctx.agent_id, message.id, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&message)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    ExecutionError::ResourceExhaustion(format!("{}: {}", status, body))
                }
                StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => {
                    ExecutionError::timeout(format!("remote agent {}: {}", status, body), 0)
                }
                s if s.is_client_error() => ExecutionError::application(format!("{}: {}", status, body)),
                _ => ExecutionError::CommunicationFailure(format!("{}: {}", status, body)),
            });
        }

        let reply: Message = response.json().await.map_err(|e| {
            ExecutionError::CommunicationFailure(format!("malformed reply from {}: {}", self.endpoint, e))
        })?;
        if reply.kind == MessageKind::Error {
            let reason = reply
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| reply.payload.to_string());
            return Err(ExecutionError::application(reason));
        }
        Ok(reply)
    }
}
