//! Append-only audit trail of an agent's traffic and lifecycle.
//!
//! Entries are never mutated once appended. When a store is attached,
//! `flush` writes every entry not yet persisted as a small group of triples:
//!
//! ```text
//! <diary:{agent}/{incarnation}/{seq}> rdf:type mesh:DiaryEntry
//!                       mesh:agent <agent:{agent}>
//!                       mesh:seq   {seq}
//!                       mesh:kind  "received" | "sent" | "transition" | "failure"
//!                       mesh:at    "{rfc3339}"
//!                       mesh:summary "..."
//! ```

use agentmesh_core::{AgentId, StoreError};
use agentmesh_kg::{Triple, TripleStore, Update, Value};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const DIARY_ENTRY_CLASS: &str = "mesh:DiaryEntry";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiaryKind {
    Received,
    Sent,
    Transition,
    Failure,
}

impl DiaryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Transition => "transition",
            Self::Failure => "failure",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub seq: u64,
    pub kind: DiaryKind,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

impl DiaryEntry {
    fn triples(&self, agent: &AgentId, incarnation: i64) -> Vec<Triple> {
        let subject = format!("diary:{}/{}/{}", agent, incarnation, self.seq);
        let s = subject.as_str();
        vec![
            Triple::typed(s, DIARY_ENTRY_CLASS),
            Triple::new(s, "mesh:agent", Value::Ref(agent_iri(agent).into())),
            Triple::new(s, "mesh:seq", self.seq as i64),
            Triple::new(s, "mesh:kind", self.kind.as_str()),
            Triple::new(s, "mesh:at", self.timestamp.to_rfc3339()),
            Triple::new(s, "mesh:summary", self.summary.as_str()),
        ]
    }
}

/// Resource name under which an agent's facts are stored.
pub fn agent_iri(agent: &AgentId) -> String {
    format!("agent:{}", agent)
}

struct DiaryState {
    entries: Vec<DiaryEntry>,
    persisted: usize,
}

pub struct Diary {
    agent: AgentId,
    /// Distinguishes a recreated agent's entries from its predecessor's.
    incarnation: i64,
    state: Mutex<DiaryState>,
    store: Option<Arc<dyn TripleStore>>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl Diary {
    pub fn new(agent: AgentId, store: Option<Arc<dyn TripleStore>>) -> Self {
        Self {
            agent,
            incarnation: Utc::now().timestamp_micros(),
            state: Mutex::new(DiaryState {
                entries: Vec::new(),
                persisted: 0,
            }),
            store,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn record(&self, kind: DiaryKind, summary: impl Into<String>) -> DiaryEntry {
        let mut state = self.state.lock();
        let entry = DiaryEntry {
            seq: state.entries.len() as u64,
            kind,
            summary: summary.into(),
            timestamp: Utc::now(),
        };
        state.entries.push(entry.clone());
        entry
    }

    pub fn entries(&self) -> Vec<DiaryEntry> {
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries appended but not yet written to the store.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.entries.len() - state.persisted
    }

    /// Persist every pending entry. A failed write leaves them pending.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let _guard = self.flush_lock.lock().await;
        let (batch, upto) = {
            let state = self.state.lock();
            (state.entries[state.persisted..].to_vec(), state.entries.len())
        };
        if batch.is_empty() {
            return Ok(0);
        }
        let update = Update::inserting(batch.iter().flat_map(|e| e.triples(&self.agent, self.incarnation)));
        if let Err(e) = store.apply_update(&update, None).await {
            warn!("diary flush for {} failed: {}", self.agent, e);
            return Err(e);
        }
        self.state.lock().persisted = upto;
        Ok(batch.len())
    }
}
