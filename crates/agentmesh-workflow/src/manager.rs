//! Workflow manager: submission, run tracking, cancellation and resume.

use crate::definition::WorkflowDefinition;
use crate::executor::{Execution, Services};
use crate::graph::StepGraph;
use crate::repository::RunRepository;
use crate::run::{RunReport, RunState};
use crate::validate;
use agentmesh_core::config::WorkflowConfig;
use agentmesh_core::{Error, RunId, ValidationError};
use agentmesh_kg::TripleStore;
use agentmesh_recovery::Recovery;
use agentmesh_registry::{AgentFactory, Registry};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Submission result
// ---------------------------------------------------------------------------

/// Outcome of a submission. On the wire:
/// `{"accepted": true, "run_id": ...}` or `{"accepted": false, "violations": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "SubmissionBody", from = "SubmissionBody")]
pub enum Submission {
    Accepted { run_id: RunId },
    Rejected { violations: Vec<ValidationError> },
}

impl Submission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Self::Accepted { run_id } => Some(run_id),
            Self::Rejected { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SubmissionBody {
    accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    violations: Option<Vec<ValidationError>>,
}

impl From<Submission> for SubmissionBody {
    fn from(s: Submission) -> Self {
        match s {
            Submission::Accepted { run_id } => Self {
                accepted: true,
                run_id: Some(run_id),
                violations: None,
            },
            Submission::Rejected { violations } => Self {
                accepted: false,
                run_id: None,
                violations: Some(violations),
            },
        }
    }
}

impl From<SubmissionBody> for Submission {
    fn from(body: SubmissionBody) -> Self {
        match (body.accepted, body.run_id) {
            (true, Some(run_id)) => Self::Accepted { run_id },
            _ => Self::Rejected {
                violations: body.violations.unwrap_or_default(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct RunHandle {
    state: Arc<Mutex<RunState>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

pub struct WorkflowManager {
    services: Arc<Services>,
    runs: DashMap<RunId, RunHandle>,
    halt: CancellationToken,
}

impl WorkflowManager {
    pub fn new(
        registry: Arc<Registry>,
        recovery: Arc<Recovery>,
        store: Arc<dyn TripleStore>,
        repository: Arc<dyn RunRepository>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            services: Arc::new(Services {
                registry,
                factory: None,
                recovery,
                store,
                repository,
                config,
            }),
            runs: DashMap::new(),
            halt: CancellationToken::new(),
        }
    }

    /// Allow `Recreate` recovery decisions to rebuild agents.
    pub fn with_factory(mut self, factory: Arc<AgentFactory>) -> Self {
        if let Some(services) = Arc::get_mut(&mut self.services) {
            services.factory = Some(factory);
        }
        self
    }

    pub fn validate(&self, def: &WorkflowDefinition) -> Result<(), Vec<ValidationError>> {
        validate::validate(def, &self.services.registry).map(|_| ())
    }

    /// Validate and start a run. A rejected workflow has no side effects.
    pub async fn submit(&self, def: WorkflowDefinition) -> Result<Submission, Error> {
        let graph = match validate::validate(&def, &self.services.registry) {
            Ok(graph) => graph,
            Err(violations) => {
                warn!("workflow {} rejected: {} violation(s)", def.id, violations.len());
                return Ok(Submission::Rejected { violations });
            }
        };

        let version = self.services.repository.save_definition(&def).await?;
        let run_id = RunId::generate();
        let mut state = RunState::new(
            run_id.clone(),
            def.id.clone(),
            version,
            def.steps.iter().map(|s| s.id.clone()),
        );
        state.version = 1;
        self.services.repository.save_run(&state).await?;
        info!("workflow {} v{} accepted as run {}", def.id, version, run_id);

        self.start(graph, state, def.concurrency_limit);
        Ok(Submission::Accepted { run_id })
    }

    fn start(&self, graph: StepGraph, state: RunState, limit: Option<usize>) {
        let run_id = state.run_id.clone();
        let state = Arc::new(Mutex::new(state));
        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(false);
        let execution = Execution {
            services: self.services.clone(),
            graph: Arc::new(graph),
            state: state.clone(),
            concurrency: limit.unwrap_or(self.services.config.default_concurrency).max(1),
            cancel: cancel.clone(),
            halt: self.halt.child_token(),
        };
        self.runs.insert(run_id, RunHandle { state, cancel, done });
        tokio::spawn(async move {
            let report = execution.run().await;
            info!("run {} finished: {}", report.run_id, report.status);
            let _ = done_tx.send(true);
        });
    }

    /// Current status of a run, live or persisted.
    pub async fn status(&self, run_id: &RunId) -> Result<RunReport, Error> {
        if let Some(handle) = self.runs.get(run_id) {
            return Ok(handle.state.lock().report());
        }
        match self.services.repository.load_run(run_id).await? {
            Some(state) => Ok(state.report()),
            None => Err(Error::RunNotFound(run_id.clone())),
        }
    }

    /// Wait until a run started by this manager stops executing.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunReport, Error> {
        let done = self.runs.get(run_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            // a closed channel means the task ended; status says how
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(run_id).await
    }

    /// Stop a live run and roll it back. Finished runs are left alone.
    pub async fn cancel(&self, run_id: &RunId) -> Result<(), Error> {
        if let Some(handle) = self.runs.get(run_id) {
            info!("cancelling run {}", run_id);
            handle.cancel.cancel();
            return Ok(());
        }
        match self.services.repository.load_run(run_id).await? {
            Some(_) => Ok(()),
            None => Err(Error::RunNotFound(run_id.clone())),
        }
    }

    /// Continue a persisted run from its last snapshot. Committed steps keep
    /// their outputs; everything else is dispatched again.
    pub async fn resume(&self, run_id: &RunId) -> Result<(), Error> {
        if let Some(handle) = self.runs.get(run_id) {
            if !*handle.done.borrow() {
                return Ok(());
            }
        }
        let repository = &self.services.repository;
        let mut state = repository
            .load_run(run_id)
            .await?
            .ok_or_else(|| Error::RunNotFound(run_id.clone()))?;
        if state.status.is_terminal() {
            info!("run {} already {}", run_id, state.status);
            return Ok(());
        }
        let def = repository
            .load_definition(&state.workflow_id, state.workflow_version)
            .await?
            .ok_or_else(|| {
                Error::internal(format!(
                    "definition {} v{} for run {} is missing",
                    state.workflow_id, state.workflow_version, run_id
                ))
            })?;
        let graph = validate::validate(&def, &self.services.registry).map_err(Error::Validation)?;

        let reset = state.reset_interrupted();
        state.version += 1;
        repository.save_run(&state).await?;
        info!(
            "resuming run {} from snapshot v{} ({} interrupted step(s) reset)",
            run_id, state.version, reset
        );
        self.start(graph, state, def.concurrency_limit);
        Ok(())
    }

    pub fn runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Suspend every live run, persisting a resumable snapshot of each.
    pub async fn shutdown(&self) {
        self.halt.cancel();
        let pending: Vec<watch::Receiver<bool>> = self.runs.iter().map(|e| e.done.clone()).collect();
        for mut done in pending {
            let _ = done.wait_for(|finished| *finished).await;
        }
        info!("workflow manager stopped ({} runs tracked)", self.runs.len());
    }
}
