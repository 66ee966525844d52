//! Core types for agentmesh: identifiers, agent status, message envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(Arc::from(s.into()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                String::deserialize(deserializer).map(Self::new)
            }
        }
    };
}

string_id!(
    /// Agent identifier - cheaply cloneable
    AgentId
);
string_id!(
    /// Capability type tag, e.g. "image.embed"
    CapabilityKind
);
string_id!(MessageId);
string_id!(WorkflowId);
string_id!(StepId);
string_id!(RunId);

impl MessageId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl RunId {
    pub fn generate() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

/// Agent lifecycle status.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Uninitialized,
    Initializing,
    Idle,
    Processing,
    Error,
    ShuttingDown,
    Terminated,
}

impl AgentStatus {
    /// Whether `self -> next` is an edge of the lifecycle state machine.
    ///
    /// `Error -> Idle` is only taken through an explicit reset.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Idle)
                | (Initializing, Error)
                | (Idle, Processing)
                | (Processing, Idle)
                | (Processing, Error)
                | (Error, Idle)
                | (Idle, ShuttingDown)
                | (Error, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }

    /// Whether the agent may be selected for a new delivery.
    pub fn is_routable(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Processing)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Processing => "processing",
            Self::Error => "error",
            Self::ShuttingDown => "shutting_down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Message type
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Error,
    Broadcast,
}

/// Where a message is addressed: a concrete agent or any holder of a capability.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Agent(AgentId),
    Capability(CapabilityKind),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{}", id),
            Self::Capability(kind) => write!(f, "capability:{}", kind),
        }
    }
}

/// The message envelope exchanged between agents. Immutable once sent:
/// replies are new messages correlated to the request id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: AgentId,
    pub recipient: Recipient,
    #[serde(default)]
    pub broadcast: bool,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<MessageId>,
}

impl Message {
    pub fn request(
        sender: impl Into<AgentId>,
        recipient: Recipient,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id: sender.into(),
            recipient,
            broadcast: false,
            kind: MessageKind::Request,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn broadcast(
        sender: impl Into<AgentId>,
        capability: impl Into<CapabilityKind>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id: sender.into(),
            recipient: Recipient::Capability(capability.into()),
            broadcast: true,
            kind: MessageKind::Broadcast,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
        }
    }

    /// Build a response addressed back to this message's sender.
    pub fn reply(&self, from: &AgentId, payload: serde_json::Value) -> Self {
        Self {
            id: MessageId::generate(),
            sender_id: from.clone(),
            recipient: Recipient::Agent(self.sender_id.clone()),
            broadcast: false,
            kind: MessageKind::Response,
            payload,
            timestamp: Utc::now(),
            correlation_id: Some(self.id.clone()),
        }
    }

    /// Build an error reply addressed back to this message's sender.
    pub fn error_reply(&self, from: &AgentId, reason: impl Into<String>) -> Self {
        let mut reply = self.reply(from, serde_json::json!({ "error": reason.into() }));
        reply.kind = MessageKind::Error;
        reply
    }

    /// Copy of this message readdressed to one concrete agent.
    pub fn addressed_to(&self, agent: &AgentId) -> Self {
        let mut copy = self.clone();
        copy.recipient = Recipient::Agent(agent.clone());
        copy
    }

    /// One-line description used for diary entries.
    pub fn summary(&self) -> String {
        let kind = match self.kind {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Broadcast => "broadcast",
        };
        format!(
            "{} {} from {} to {} ({} bytes)",
            kind,
            self.id,
            self.sender_id,
            self.recipient,
            self.payload.to_string().len()
        )
    }
}
