//! Dependency-ordered, transactional execution of one run.
//!
//! A single control loop owns scheduling, commits and the rollback decision.
//! Step attempts run as tasks that only route messages and consult
//! recovery; they never touch run state. Because commits happen in the loop
//! before successors are queued, a step always observes its predecessors'
//! committed facts.

use crate::graph::StepGraph;
use crate::repository::RunRepository;
use crate::run::{RunReport, RunState, RunStatus, StepStatus};
use agentmesh_core::config::WorkflowConfig;
use agentmesh_core::{
    AgentId, CapabilityKind, DispatchError, ExecutionError, FailureKind, Message, MessageKind,
    Recipient, RunId, StepError, StepId, StoreError,
};
use agentmesh_kg::wire::WireTriple;
use agentmesh_kg::{var, Iri, Query, Term, Triple, TripleStore, Update, UpdateReceipt, Value};
use agentmesh_recovery::{Decision, Failure, Recovery};
use agentmesh_registry::{AgentFactory, Registry, RouteOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Reply payload key holding facts the step asserts, in wire triple form.
pub const FACTS_KEY: &str = "facts";
pub const STEP_RUN_CLASS: &str = "mesh:StepRun";

/// Resource name of one step within one run.
pub fn step_iri(run_id: &RunId, step: &StepId) -> String {
    format!("run:{}/{}", run_id, step)
}

pub fn output_predicate(name: &str) -> String {
    format!("mesh:output/{}", name)
}

/// Everything a run needs from the outside, passed explicitly.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<Registry>,
    pub factory: Option<Arc<AgentFactory>>,
    pub recovery: Arc<Recovery>,
    pub store: Arc<dyn TripleStore>,
    pub repository: Arc<dyn RunRepository>,
    pub config: WorkflowConfig,
}

impl Services {
    fn store_timeout(&self) -> Option<Duration> {
        Some(self.config.step_timeout())
    }
}

struct StepSuccess {
    agent: AgentId,
    attempts: u32,
    payload: serde_json::Value,
}

struct StepFailure {
    attempts: u32,
    errors: Vec<StepError>,
    cancelled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stop {
    Failed,
    Cancelled,
    /// Manager shutdown: keep committed work, leave the run resumable.
    Halted,
}

pub(crate) struct Execution {
    pub services: Arc<Services>,
    pub graph: Arc<StepGraph>,
    pub state: Arc<Mutex<RunState>>,
    pub concurrency: usize,
    pub cancel: CancellationToken,
    pub halt: CancellationToken,
}

impl Execution {
    pub async fn run(self) -> RunReport {
        let run_id = self.state.lock().run_id.clone();
        let steps_cancel = CancellationToken::new();
        let mut ready = self.initially_ready();
        let mut in_flight: JoinSet<(usize, Result<StepSuccess, StepFailure>)> = JoinSet::new();
        let mut stop: Option<Stop> = None;
        info!(
            "run {}: {} steps, {} ready, concurrency {}",
            run_id,
            self.graph.len(),
            ready.len(),
            self.concurrency
        );

        loop {
            while stop.is_none() && in_flight.len() < self.concurrency {
                let Some(i) = ready.pop_front() else { break };
                match self.start_step(i, &run_id, &steps_cancel) {
                    Ok(task) => {
                        in_flight.spawn(async move { (i, task.await) });
                    }
                    Err(step_error) => {
                        self.fail_step(i, vec![step_error]);
                        stop = Some(Stop::Failed);
                        steps_cancel.cancel();
                    }
                }
            }
            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if stop.is_none() => {
                    info!("run {}: cancellation requested", run_id);
                    stop = Some(Stop::Cancelled);
                    steps_cancel.cancel();
                }
                _ = self.halt.cancelled(), if stop.is_none() => {
                    info!("run {}: halting for shutdown", run_id);
                    stop = Some(Stop::Halted);
                    steps_cancel.cancel();
                }
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (i, outcome) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!("run {}: step task failed to join: {}", run_id, e);
                            if stop.is_none() {
                                stop = Some(Stop::Failed);
                                steps_cancel.cancel();
                            }
                            continue;
                        }
                    };
                    match outcome {
                        Ok(success) => match self.commit_step(i, success).await {
                            Ok(()) => {
                                if stop.is_none() {
                                    ready.extend(self.newly_ready(i));
                                }
                            }
                            Err(step_error) => {
                                self.fail_step(i, vec![step_error]);
                                if stop.is_none() {
                                    stop = Some(Stop::Failed);
                                    steps_cancel.cancel();
                                }
                            }
                        },
                        Err(failure) if stop.is_some() && (failure.cancelled || stop == Some(Stop::Halted)) => {
                            let status = if stop == Some(Stop::Halted) {
                                StepStatus::Pending
                            } else {
                                StepStatus::Cancelled
                            };
                            let mut state = self.state.lock();
                            let id = &self.graph.step(i).id;
                            if let Some(step) = state.step_mut(id) {
                                step.attempts += failure.attempts;
                            }
                            state.set_status(id, status);
                        }
                        Err(failure) => {
                            // first failure wins; later ones are only recorded
                            let first = stop.is_none();
                            self.fail_step(i, failure.errors);
                            if first {
                                stop = Some(Stop::Failed);
                                steps_cancel.cancel();
                            }
                        }
                    }
                }
            }
        }

        if stop.is_none() && self.cancel.is_cancelled() {
            stop = Some(Stop::Cancelled);
        }
        self.finish(stop).await
    }

    fn initially_ready(&self) -> VecDeque<usize> {
        let state = self.state.lock();
        let status = |i: usize| state.step(&self.graph.step(i).id).map(|s| s.status);
        (0..self.graph.len())
            .filter(|&i| status(i) == Some(StepStatus::Pending))
            .filter(|&i| {
                self.graph
                    .predecessors(i)
                    .iter()
                    .all(|&p| status(p) == Some(StepStatus::Completed))
            })
            .collect()
    }

    /// Successors of `i` whose predecessors have all committed.
    fn newly_ready(&self, i: usize) -> Vec<usize> {
        let state = self.state.lock();
        let status = |n: usize| state.step(&self.graph.step(n).id).map(|s| s.status);
        self.graph
            .successors(i)
            .iter()
            .copied()
            .filter(|&s| status(s) == Some(StepStatus::Pending))
            .filter(|&s| {
                self.graph
                    .predecessors(s)
                    .iter()
                    .all(|&p| status(p) == Some(StepStatus::Completed))
            })
            .collect()
    }

    /// Resolve inputs, mark the step Running and build its attempt task.
    fn start_step(
        &self,
        i: usize,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<impl std::future::Future<Output = Result<StepSuccess, StepFailure>>, StepError> {
        let step = self.graph.step(i).clone();
        let mut inputs = serde_json::Map::new();
        {
            let mut state = self.state.lock();
            for (name, binding) in &step.input_bindings {
                let value = state
                    .step(&binding.step)
                    .and_then(|s| s.output.get(&binding.output))
                    .cloned();
                match value {
                    Some(v) => {
                        inputs.insert(name.clone(), v);
                    }
                    None => {
                        return Err(StepError {
                            step: step.id.clone(),
                            attempt: 0,
                            error: ExecutionError::application(format!(
                                "step {} produced no output {:?} for input {:?}",
                                binding.step, binding.output, name
                            ))
                            .into(),
                        })
                    }
                }
            }
            state.set_status(&step.id, StepStatus::Running);
        }
        debug!("run {}: dispatching step {} ({})", run_id, step.id, step.required_capability);

        let payload = serde_json::json!({
            "run_id": run_id.as_str(),
            "step": step.id.as_str(),
            "inputs": inputs,
            "params": step.params,
        });
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.services.config.step_timeout());
        let attempt = StepAttempt {
            services: self.services.clone(),
            sender: AgentId::new(format!("workflow:{}", run_id)),
            step: step.id,
            capability: step.required_capability,
            payload,
            timeout,
            cancel: cancel.clone(),
        };
        Ok(attempt.run())
    }

    /// Mark `i` Failed, its transitive dependents Failed, and record errors.
    fn fail_step(&self, i: usize, errors: Vec<StepError>) {
        let mut state = self.state.lock();
        let id = self.graph.step(i).id.clone();
        for e in &errors {
            warn!("run {}: {}", state.run_id, e);
        }
        if let Some(step) = state.step_mut(&id) {
            step.attempts = step.attempts.max(errors.iter().map(|e| e.attempt).max().unwrap_or(0));
        }
        state.errors.extend(errors);
        state.set_status(&id, StepStatus::Failed);
        for d in self.graph.dependents(i) {
            let dep = self.graph.step(d).id.clone();
            if state.step(&dep).map(|s| s.status) == Some(StepStatus::Pending) {
                state.set_status(&dep, StepStatus::Failed);
            }
        }
    }

    /// Write the step's status, outputs and asserted facts as one update.
    /// The transaction logs the update's intent and the snapshot is persisted
    /// before the store is touched; the confirmed receipt replaces the intent
    /// afterwards. A snapshot that cannot be persisted fails the step.
    async fn commit_step(&self, i: usize, success: StepSuccess) -> Result<(), StepError> {
        let step = self.graph.step(i);
        let run_id = self.state.lock().run_id.clone();
        let fail = |error: ExecutionError| StepError {
            step: step.id.clone(),
            attempt: success.attempts,
            error: error.into(),
        };

        let subject = step_iri(&run_id, &step.id);
        let mut update = Update::new()
            .insert(Triple::typed(subject.as_str(), STEP_RUN_CLASS))
            .insert(Triple::new(subject.as_str(), "mesh:run", Value::Ref(format!("run:{}", run_id).into())))
            .insert(Triple::new(subject.as_str(), "mesh:agent", Value::Ref(format!("agent:{}", success.agent).into())))
            .insert(Triple::new(subject.as_str(), "mesh:status", StepStatus::Completed.to_string()));
        let mut outputs = serde_json::Map::new();
        if let serde_json::Value::Object(fields) = &success.payload {
            for (name, value) in fields {
                if name == FACTS_KEY {
                    let wire: Vec<WireTriple> = serde_json::from_value(value.clone())
                        .map_err(|e| fail(ExecutionError::application(format!("malformed facts: {}", e))))?;
                    for w in wire {
                        let triple = w
                            .into_triple()
                            .map_err(|e| fail(ExecutionError::application(format!("malformed fact: {}", e))))?;
                        update.insert.push(triple.with_provenance(subject.as_str()));
                    }
                } else {
                    update.insert.push(Triple::new(subject.as_str(), output_predicate(name), Value::from_json(value)));
                    outputs.insert(name.clone(), value.clone());
                }
            }
        }

        let store_failure = |e: StoreError| match e {
            StoreError::Timeout(ms) => fail(ExecutionError::timeout(format!("commit of step {}", step.id), ms)),
            other => fail(ExecutionError::CommunicationFailure(format!("commit of step {}: {}", step.id, other))),
        };

        // write-ahead: the intent is durable before the store sees the update
        let intent = UpdateReceipt {
            inserted: self.absent_inserts(&update, &subject).await.map_err(store_failure)?,
            removed: Vec::new(),
        };
        let (slot, snapshot) = {
            let mut state = self.state.lock();
            let slot = state
                .transaction
                .record_intent(Some(step.id.clone()), format!("commit step {}", step.id), intent)
                .map_err(|e| fail(ExecutionError::StateCorruption(e.to_string())))?;
            state.version += 1;
            (slot, state.clone())
        };
        self.persist(&snapshot).await.map_err(fail)?;

        let receipt = self
            .services
            .store
            .apply_update(&update, self.services.store_timeout())
            .await
            .map_err(store_failure)?;

        let snapshot = {
            let mut state = self.state.lock();
            state
                .transaction
                .settle(slot, receipt)
                .map_err(|e| fail(ExecutionError::StateCorruption(e.to_string())))?;
            if let Some(s) = state.step_mut(&step.id) {
                s.agent = Some(success.agent.clone());
                s.attempts = success.attempts;
                s.output = serde_json::Value::Object(outputs);
            }
            state.set_status(&step.id, StepStatus::Completed);
            state.version += 1;
            state.clone()
        };
        self.persist(&snapshot).await.map_err(fail)?;
        info!(
            "run {}: step {} committed by {} after {} attempt(s)",
            run_id, step.id, success.agent, success.attempts
        );
        Ok(())
    }

    /// Inserts of `update` the store does not hold yet. Facts about the
    /// step's own resource are run-scoped and always count.
    async fn absent_inserts(&self, update: &Update, own: &str) -> Result<Vec<Triple>, StoreError> {
        let mut held: HashMap<(Iri, Iri), Vec<Value>> = HashMap::new();
        let mut absent = Vec::new();
        for triple in &update.insert {
            if triple.subject.as_str() != own {
                let key = (triple.subject.clone(), triple.predicate.clone());
                if !held.contains_key(&key) {
                    // open object: exact match, no subclass inference
                    let query = Query::select(["o"]).pattern(
                        Term::Const(Value::Ref(triple.subject.clone())),
                        Term::Const(Value::Ref(triple.predicate.clone())),
                        var("o"),
                    );
                    let rows = self
                        .services
                        .store
                        .execute_query(&query, self.services.store_timeout())
                        .await?;
                    held.insert(key.clone(), rows.iter().filter_map(|r| r.get("o").cloned()).collect());
                }
                if held.get(&key).is_some_and(|objects| objects.contains(&triple.object)) {
                    continue;
                }
            }
            absent.push(triple.clone());
        }
        Ok(absent)
    }

    async fn persist(&self, snapshot: &RunState) -> Result<(), ExecutionError> {
        self.services.repository.save_run(snapshot).await.map_err(|e| {
            error!("run {}: snapshot v{} not persisted: {}", snapshot.run_id, snapshot.version, e);
            ExecutionError::StateCorruption(format!("snapshot v{} not persisted: {}", snapshot.version, e))
        })
    }

    async fn finish(self, stop: Option<Stop>) -> RunReport {
        let all_completed = {
            let state = self.state.lock();
            state.steps.values().all(|s| s.status == StepStatus::Completed)
        };

        let snapshot = match stop {
            None if all_completed => {
                let mut state = self.state.lock();
                if let Err(e) = state.transaction.commit() {
                    error!("run {}: {}", state.run_id, e);
                }
                state.finish(RunStatus::Committed);
                state.version += 1;
                state.clone()
            }
            Some(Stop::Halted) => {
                let mut state = self.state.lock();
                state.reset_interrupted();
                state.version += 1;
                info!("run {} suspended at snapshot v{}", state.run_id, state.version);
                state.clone()
            }
            other => self.roll_back(other == Some(Stop::Cancelled)).await,
        };
        // already logged; the in-memory state still answers status queries
        let _ = self.persist(&snapshot).await;
        snapshot.report()
    }

    /// The run's only rollback path.
    async fn roll_back(&self, cancelled: bool) -> RunState {
        let mut transaction = {
            let state = self.state.lock();
            state.transaction.clone()
        };
        let result = transaction
            .rollback(self.services.store.as_ref(), self.services.store_timeout())
            .await;

        let mut state = self.state.lock();
        state.transaction = transaction;
        let ids: Vec<StepId> = state.steps.keys().cloned().collect();
        for id in &ids {
            let next = match state.step(id).map(|s| s.status) {
                Some(StepStatus::Completed) => StepStatus::RolledBack,
                Some(StepStatus::Pending) | Some(StepStatus::Running) => StepStatus::Cancelled,
                _ => continue,
            };
            state.set_status(id, next);
        }
        match result {
            Ok(undone) => {
                info!("run {} rolled back ({} mutations undone)", state.run_id, undone);
                state.finish(if cancelled { RunStatus::Cancelled } else { RunStatus::RolledBack });
            }
            Err(e) => {
                state.rollback_error = Some(e);
                state.finish(RunStatus::RollbackFailed);
            }
        }
        state.version += 1;
        state.clone()
    }
}

/// One step's attempts: route, classify, apply the recovery decision.
struct StepAttempt {
    services: Arc<Services>,
    sender: AgentId,
    step: StepId,
    capability: CapabilityKind,
    payload: serde_json::Value,
    timeout: Duration,
    cancel: CancellationToken,
}

impl StepAttempt {
    async fn run(self) -> Result<StepSuccess, StepFailure> {
        let registry = &self.services.registry;
        let message = Message::request(
            self.sender.clone(),
            Recipient::Capability(self.capability.clone()),
            self.payload.clone(),
        );
        let mut exclude: Vec<AgentId> = Vec::new();
        let mut pinned: Option<AgentId> = None;
        let mut errors = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let options = RouteOptions::new()
                .timeout(self.timeout)
                .cancel(self.cancel.clone())
                .exclude(exclude.iter().cloned());
            let target = match pinned.take() {
                Some(id) => Ok(id),
                None => registry
                    .select(&self.capability, &options)
                    .map(|agent| agent.id().clone()),
            };
            let result = match &target {
                Ok(id) => registry.route_to(id, &message, &options).await,
                Err(e) => Err(DispatchError::from(e.clone())),
            };
            let agent = target.ok();

            let error = match result {
                Ok(routed) if routed.reply.kind != MessageKind::Error => {
                    return Ok(StepSuccess {
                        agent: routed.agent_id,
                        attempts: attempt,
                        payload: routed.reply.payload,
                    });
                }
                Ok(routed) => {
                    let reason = routed
                        .reply
                        .payload
                        .get("error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("error reply")
                        .to_string();
                    DispatchError::from(ExecutionError::Application(reason))
                }
                Err(e) => e,
            };
            errors.push(StepError {
                step: self.step.clone(),
                attempt,
                error: error.clone(),
            });
            if error.failure_kind() == FailureKind::Cancelled {
                return Err(StepFailure {
                    attempts: attempt,
                    errors,
                    cancelled: true,
                });
            }
            if self.cancel.is_cancelled() {
                // the run already stopped: a real failure is recorded, never retried
                return Err(StepFailure {
                    attempts: attempt,
                    errors,
                    cancelled: false,
                });
            }

            let failure = Failure::new(error, attempt)
                .agent(agent.clone())
                .capability(self.capability.clone())
                .step(self.step.clone());
            let decision = self.services.recovery.decide(&failure);
            match &decision {
                Decision::Retry { .. } => pinned = agent,
                Decision::Reroute { .. } => exclude.extend(agent),
                Decision::Recreate { .. } => pinned = self.recreate(agent, &mut exclude).await,
                Decision::Escalate | Decision::GiveUp => {
                    return Err(StepFailure {
                        attempts: attempt,
                        errors,
                        cancelled: false,
                    });
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(StepFailure { attempts: attempt, errors, cancelled: true });
                }
                _ = tokio::time::sleep(decision.delay()) => {}
            }
        }
    }

    /// Replace a broken agent through the factory; without one, fall back to
    /// routing around it.
    async fn recreate(&self, agent: Option<AgentId>, exclude: &mut Vec<AgentId>) -> Option<AgentId> {
        let agent = agent?;
        let Some(factory) = &self.services.factory else {
            exclude.push(agent);
            return None;
        };
        match factory.recreate(&agent).await {
            Ok(fresh) => Some(fresh.id().clone()),
            Err(e) => {
                warn!("step {}: could not recreate agent {}: {}", self.step, agent, e);
                exclude.push(agent);
                None
            }
        }
    }
}
