//! Durable storage for workflow definitions and run snapshots.
//!
//! Definitions are versioned: saving a changed definition under an existing
//! id creates the next version, saving an identical one reuses the latest.
//! Run snapshots carry their own version and older snapshots never replace
//! newer ones.

use crate::definition::WorkflowDefinition;
use crate::run::RunState;
use agentmesh_core::{Error, RunId, WorkflowId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[async_trait::async_trait]
pub trait RunRepository: Send + Sync {
    /// Store `def` and return its version (1-based).
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<u64, Error>;

    async fn load_definition(&self, id: &WorkflowId, version: u64) -> Result<Option<WorkflowDefinition>, Error>;

    async fn save_run(&self, state: &RunState) -> Result<(), Error>;

    async fn load_run(&self, run_id: &RunId) -> Result<Option<RunState>, Error>;

    async fn list_runs(&self) -> Result<Vec<RunId>, Error>;

    /// Where the data lives (for human inspection).
    fn location(&self) -> String;
}

fn stale(state: &RunState, stored: u64) -> Error {
    Error::internal(format!(
        "stale snapshot for run {}: version {} <= stored {}",
        state.run_id, state.version, stored
    ))
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryRepository {
    definitions: RwLock<HashMap<WorkflowId, Vec<WorkflowDefinition>>>,
    runs: RwLock<HashMap<RunId, RunState>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunRepository for MemoryRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<u64, Error> {
        let mut defs = self.definitions.write();
        let versions = defs.entry(def.id.clone()).or_default();
        if versions.last() != Some(def) {
            versions.push(def.clone());
        }
        Ok(versions.len() as u64)
    }

    async fn load_definition(&self, id: &WorkflowId, version: u64) -> Result<Option<WorkflowDefinition>, Error> {
        let defs = self.definitions.read();
        let Some(index) = (version as usize).checked_sub(1) else {
            return Ok(None);
        };
        Ok(defs.get(id).and_then(|v| v.get(index)).cloned())
    }

    async fn save_run(&self, state: &RunState) -> Result<(), Error> {
        let mut runs = self.runs.write();
        if let Some(stored) = runs.get(&state.run_id) {
            if stored.version >= state.version {
                return Err(stale(state, stored.version));
            }
        }
        runs.insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Option<RunState>, Error> {
        Ok(self.runs.read().get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, Error> {
        let mut ids: Vec<_> = self.runs.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn location(&self) -> String {
        "memory".into()
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// JSON files under a state directory:
/// `workflows/<id>/v<n>.json` and `runs/<run_id>.json`.
pub struct FileRepository {
    base_dir: PathBuf,
    /// serializes read-modify-write of version numbers
    lock: tokio::sync::Mutex<()>,
}

/// Ids are free-form; keep file names to a safe alphabet.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

impl FileRepository {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn workflow_dir(&self, id: &WorkflowId) -> PathBuf {
        self.base_dir.join("workflows").join(file_stem(id.as_str()))
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.base_dir.join("runs").join(format!("{}.json", file_stem(run_id.as_str())))
    }

    async fn latest_version(&self, id: &WorkflowId) -> Result<u64, Error> {
        let dir = self.workflow_dir(id);
        let mut latest = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let version = name
                .to_str()
                .and_then(|n| n.strip_prefix('v'))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(v) = version {
                latest = latest.max(v);
            }
        }
        Ok(latest)
    }

    /// Write via a temporary file and rename so readers never see a torn file.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("wrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, Error> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl RunRepository for FileRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<u64, Error> {
        let _guard = self.lock.lock().await;
        let latest = self.latest_version(&def.id).await?;
        if latest > 0 {
            let current: Option<WorkflowDefinition> =
                Self::read_json(&self.workflow_dir(&def.id).join(format!("v{}.json", latest))).await?;
            if current.as_ref() == Some(def) {
                return Ok(latest);
            }
        }
        let version = latest + 1;
        let path = self.workflow_dir(&def.id).join(format!("v{}.json", version));
        Self::write_atomic(&path, &serde_json::to_vec_pretty(def)?).await?;
        Ok(version)
    }

    async fn load_definition(&self, id: &WorkflowId, version: u64) -> Result<Option<WorkflowDefinition>, Error> {
        Self::read_json(&self.workflow_dir(id).join(format!("v{}.json", version))).await
    }

    async fn save_run(&self, state: &RunState) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let path = self.run_path(&state.run_id);
        if let Some(stored) = Self::read_json::<RunState>(&path).await? {
            if stored.version >= state.version {
                return Err(stale(state, stored.version));
            }
        }
        Self::write_atomic(&path, &serde_json::to_vec_pretty(state)?).await
    }

    async fn load_run(&self, run_id: &RunId) -> Result<Option<RunState>, Error> {
        Self::read_json(&self.run_path(run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<RunId>, Error> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.base_dir.join("runs")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = Self::read_json::<RunState>(&path).await? {
                ids.push(state.run_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn location(&self) -> String {
        self.base_dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDefinition;
    use agentmesh_core::StepId;

    fn def(cap: &str) -> WorkflowDefinition {
        WorkflowDefinition::new("wf/one").step(StepDefinition::new("a", cap))
    }

    async fn exercise(repo: &dyn RunRepository) {
        assert_eq!(repo.save_definition(&def("x")).await.unwrap(), 1);
        assert_eq!(repo.save_definition(&def("x")).await.unwrap(), 1);
        assert_eq!(repo.save_definition(&def("y")).await.unwrap(), 2);
        let v1 = repo.load_definition(&"wf/one".into(), 1).await.unwrap().unwrap();
        assert_eq!(v1.steps[0].required_capability.as_str(), "x");
        assert!(repo.load_definition(&"wf/one".into(), 3).await.unwrap().is_none());

        let mut state = RunState::new(RunId::new("r1"), "wf/one".into(), 2, [StepId::new("a")]);
        state.version = 1;
        repo.save_run(&state).await.unwrap();
        assert!(repo.save_run(&state).await.is_err());
        state.version = 2;
        repo.save_run(&state).await.unwrap();
        let loaded = repo.load_run(&"r1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(repo.list_runs().await.unwrap(), vec![RunId::new("r1")]);
    }

    #[tokio::test]
    async fn memory_repository_versions() {
        exercise(&MemoryRepository::new()).await;
    }

    #[tokio::test]
    async fn file_repository_versions() {
        let tmp = tempfile::tempdir().unwrap();
        exercise(&FileRepository::new(tmp.path())).await;
        let reopened = FileRepository::new(tmp.path());
        assert!(reopened.load_run(&"r1".into()).await.unwrap().is_some());
        assert_eq!(reopened.save_definition(&def("y")).await.unwrap(), 2);
    }
}
