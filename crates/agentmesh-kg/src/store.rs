//! Backend-agnostic triple store interface.
//!
//! Callers depend only on these semantics. The in-process backend never
//! returns `StoreError::Network`/`Protocol`; remote backends may.

use crate::query::{BindingRow, Query};
use crate::term::Triple;
use agentmesh_core::StoreError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// A batch mutation. Removals are applied before insertions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(default)]
    pub insert: Vec<Triple>,
    #[serde(default)]
    pub remove: Vec<Triple>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, triple: Triple) -> Self {
        self.insert.push(triple);
        self
    }

    pub fn remove(mut self, triple: Triple) -> Self {
        self.remove.push(triple);
        self
    }

    pub fn inserting(triples: impl IntoIterator<Item = Triple>) -> Self {
        Self {
            insert: triples.into_iter().collect(),
            remove: Vec::new(),
        }
    }

    pub fn removing(triples: impl IntoIterator<Item = Triple>) -> Self {
        Self {
            insert: Vec::new(),
            remove: triples.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.remove.is_empty()
    }
}

/// Effective changes made by an update: facts that were absent and are now
/// present, and facts that were present and are now gone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReceipt {
    #[serde(default)]
    pub inserted: Vec<Triple>,
    #[serde(default)]
    pub removed: Vec<Triple>,
}

impl UpdateReceipt {
    /// The update that undoes exactly these changes.
    pub fn inverse(&self) -> Update {
        Update {
            insert: self.removed.clone(),
            remove: self.inserted.clone(),
        }
    }

    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }
}

#[async_trait::async_trait]
pub trait TripleStore: Send + Sync {
    /// Ordered binding rows, values already coerced to their declared types.
    async fn execute_query(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Vec<BindingRow>, StoreError>;

    async fn apply_update(
        &self,
        update: &Update,
        timeout: Option<Duration>,
    ) -> Result<UpdateReceipt, StoreError>;

    /// Where the data lives (for human inspection).
    fn location(&self) -> String;
}

/// Run `fut` under an optional deadline, mapping expiry to `StoreError::Timeout`.
pub async fn bounded<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StoreError::Timeout(limit.as_millis() as u64))?,
        None => fut.await,
    }
}
