//! In-process backend with an optional append-only durability log.
//!
//! Every update is appended to the log (one JSON line) before it is applied,
//! and the log is replayed on open. Writers are serialized by an async lock;
//! readers only take the graph's read lock for the duration of evaluation.

use crate::graph::Graph;
use crate::index::GraphIndex;
use crate::query::{BindingRow, Query};
use crate::store::{bounded, TripleStore, Update, UpdateReceipt};
use crate::term::Triple;
use agentmesh_core::StoreError;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub struct MemoryStore {
    graph: RwLock<Graph>,
    writer: tokio::sync::Mutex<()>,
    log_path: Option<PathBuf>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self {
            graph: RwLock::new(Graph::new()),
            writer: tokio::sync::Mutex::new(()),
            log_path: None,
        }
    }

    /// Durable store backed by `path`. Replays any existing log.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut graph = Graph::new();
        let mut replayed = 0usize;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    let update: Update = serde_json::from_str(line)?;
                    graph.apply(&update);
                    replayed += 1;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            "Opened triple store {} ({} updates replayed, {} triples)",
            path.display(),
            replayed,
            graph.len()
        );
        Ok(Self {
            graph: RwLock::new(graph),
            writer: tokio::sync::Mutex::new(()),
            log_path: Some(path),
        })
    }

    pub fn len(&self) -> usize {
        self.graph.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.read().is_empty()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.graph.read().contains(triple)
    }

    /// Copy of the current indices, for inspection and tests.
    pub fn index_snapshot(&self) -> GraphIndex {
        self.graph.read().index().clone()
    }

    /// All triples in insertion order.
    pub fn triples(&self) -> Vec<Triple> {
        self.graph.read().triples().cloned().collect()
    }

    async fn apply_logged(&self, update: &Update) -> Result<UpdateReceipt, StoreError> {
        let _writer = self.writer.lock().await;
        if update.is_empty() {
            return Ok(UpdateReceipt::default());
        }
        self.append_log(update).await?;
        let receipt = self.graph.write().apply(update);
        debug!(
            "applied update: +{} -{}",
            receipt.inserted.len(),
            receipt.removed.len()
        );
        Ok(receipt)
    }

    async fn append_log(&self, update: &Update) -> Result<(), StoreError> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut line = serde_json::to_string(update)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl TripleStore for MemoryStore {
    async fn execute_query(
        &self,
        query: &Query,
        timeout: Option<Duration>,
    ) -> Result<Vec<BindingRow>, StoreError> {
        let rows = self.graph.read().evaluate(query);
        bounded(timeout, async move { Ok(rows) }).await
    }

    async fn apply_update(
        &self,
        update: &Update,
        timeout: Option<Duration>,
    ) -> Result<UpdateReceipt, StoreError> {
        bounded(timeout, self.apply_logged(update)).await
    }

    fn location(&self) -> String {
        match &self.log_path {
            Some(path) => path.display().to_string(),
            None => "memory".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{iri, var};
    use crate::term::Value;

    #[tokio::test]
    async fn update_receipt_lists_only_effective_changes() {
        let store = MemoryStore::new();
        let t = Triple::new("ex:a", "ex:p", 1i64);
        let r1 = store
            .apply_update(&Update::new().insert(t.clone()), None)
            .await
            .unwrap();
        assert_eq!(r1.inserted.len(), 1);
        let r2 = store
            .apply_update(&Update::new().insert(t.clone()), None)
            .await
            .unwrap();
        assert!(r2.is_noop());
        let r3 = store
            .apply_update(&Update::new().remove(Triple::new("ex:zz", "ex:p", 1i64)), None)
            .await
            .unwrap();
        assert!(r3.is_noop());
    }

    #[tokio::test]
    async fn log_replays_on_open() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kg/store.log");
        {
            let store = MemoryStore::open(&path).await.unwrap();
            store
                .apply_update(
                    &Update::inserting([
                        Triple::new("ex:a", "ex:p", 1i64),
                        Triple::new("ex:b", "ex:p", 2.5),
                    ]),
                    None,
                )
                .await
                .unwrap();
            store
                .apply_update(&Update::removing([Triple::new("ex:a", "ex:p", 1i64)]), None)
                .await
                .unwrap();
        }
        let reopened = MemoryStore::open(&path).await.unwrap();
        assert_eq!(reopened.len(), 1);
        let rows = reopened
            .execute_query(
                &Query::select(["s", "o"]).pattern(var("s"), iri("ex:p"), var("o")),
                None,
            )
            .await
            .unwrap();
        assert_eq!(rows[0].get("o"), Some(&Value::Float(2.5)));
    }
}
