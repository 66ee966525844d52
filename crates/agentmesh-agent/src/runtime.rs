//! Agent runtime wrapper: lifecycle state machine and self-serialized mailbox.
//!
//! Each agent owns one mailbox task that handles deliveries strictly one at a
//! time. Distinct agents run on distinct tasks, so nothing is serialized
//! across agents. Callers talk to the task through a cloneable
//! [`AgentHandle`]; every `send` carries an optional deadline and a
//! cancellation token, and expiry surfaces as `ExecutionError::Timeout`.

use crate::agent::{Agent, HandlerContext};
use crate::diary::{Diary, DiaryEntry, DiaryKind};
use crate::performance::PerformanceSnapshot;
use agentmesh_core::{
    AgentError, AgentId, AgentStatus, Capability, CapabilityKind, CapabilitySet, ExecutionError,
    Message, StoreError,
};
use agentmesh_kg::TripleStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RuntimeOptions {
    /// Bounded mailbox capacity; senders wait (within their deadline) when full.
    pub mailbox_depth: usize,
    /// Where diary entries are persisted. `None` keeps them in memory only.
    pub store: Option<Arc<dyn TripleStore>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            mailbox_depth: 64,
            store: None,
        }
    }
}

impl RuntimeOptions {
    pub fn with_store(mut self, store: Arc<dyn TripleStore>) -> Self {
        self.store = Some(store);
        self
    }
}

// ---------------------------------------------------------------------------
// Mailbox protocol
// ---------------------------------------------------------------------------

enum Command {
    Deliver(Envelope),
    Shutdown(oneshot::Sender<()>),
}

struct Envelope {
    message: Message,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<Message, ExecutionError>>,
    _load: LoadGuard,
}

/// Counts a delivery toward the agent's load for as long as it exists.
struct LoadGuard(Arc<Shared>);

impl LoadGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.queued.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    id: AgentId,
    agent_type: String,
    status: RwLock<AgentStatus>,
    capabilities: RwLock<CapabilitySet>,
    performance: Mutex<PerformanceSnapshot>,
    queued: AtomicUsize,
    diary: Diary,
}

impl Shared {
    fn transition(&self, next: AgentStatus) -> Result<(), AgentError> {
        let mut status = self.status.write();
        let from = *status;
        if from.can_transition_to(next) {
            *status = next;
            drop(status);
            self.diary
                .record(DiaryKind::Transition, format!("{} -> {}", from, next));
            debug!("agent {}: {} -> {}", self.id, from, next);
            return Ok(());
        }
        if from != AgentStatus::Terminated {
            *status = AgentStatus::Error;
        }
        drop(status);
        let err = AgentError::InvalidStateTransition {
            agent: self.id.clone(),
            from,
            to: next,
        };
        self.diary.record(DiaryKind::Failure, err.to_string());
        warn!("{}", err);
        Err(err)
    }

    fn status(&self) -> AgentStatus {
        *self.status.read()
    }
}

fn corrupted(e: AgentError) -> ExecutionError {
    ExecutionError::StateCorruption(e.to_string())
}

// ---------------------------------------------------------------------------
// AgentHandle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.shared.id)
            .field("agent_type", &self.shared.agent_type)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl AgentHandle {
    /// Initialize `agent` and start its mailbox task.
    ///
    /// If initialization fails the agent ends in `Error`, no task is
    /// started, and the error is returned.
    pub async fn spawn(
        id: impl Into<AgentId>,
        mut agent: Box<dyn Agent>,
        capabilities: CapabilitySet,
        options: RuntimeOptions,
    ) -> Result<Self, ExecutionError> {
        let id = id.into();
        let shared = Arc::new(Shared {
            diary: Diary::new(id.clone(), options.store.clone()),
            id,
            agent_type: agent.agent_type().to_string(),
            status: RwLock::new(AgentStatus::Uninitialized),
            capabilities: RwLock::new(capabilities),
            performance: Mutex::new(PerformanceSnapshot::default()),
            queued: AtomicUsize::new(0),
        });

        shared.transition(AgentStatus::Initializing).map_err(corrupted)?;
        if let Err(e) = agent.initialize().await {
            shared.diary.record(DiaryKind::Failure, format!("initialization failed: {}", e));
            let _ = shared.transition(AgentStatus::Error);
            let _ = shared.diary.flush().await;
            warn!("agent {} failed to initialize: {}", shared.id, e);
            return Err(e);
        }
        shared.transition(AgentStatus::Idle).map_err(corrupted)?;

        let (tx, rx) = mpsc::channel(options.mailbox_depth.max(1));
        tokio::spawn(run_mailbox(shared.clone(), agent, rx));
        info!("agent {} ({}) started", shared.id, shared.agent_type);
        Ok(Self { shared, tx })
    }

    pub fn id(&self) -> &AgentId {
        &self.shared.id
    }

    pub fn agent_type(&self) -> &str {
        &self.shared.agent_type
    }

    pub fn status(&self) -> AgentStatus {
        self.shared.status()
    }

    pub fn is_routable(&self) -> bool {
        self.status().is_routable()
    }

    /// Apply a lifecycle transition. An edge outside the state machine forces
    /// the agent into `Error`, is written to the diary, and is returned.
    pub fn transition(&self, next: AgentStatus) -> Result<(), AgentError> {
        self.shared.transition(next)
    }

    /// Explicit recovery reset: `Error -> Idle`. Refused from any other state
    /// without side effects.
    pub fn reset(&self) -> Result<(), AgentError> {
        let current = self.status();
        if current != AgentStatus::Error {
            return Err(AgentError::InvalidStateTransition {
                agent: self.shared.id.clone(),
                from: current,
                to: AgentStatus::Idle,
            });
        }
        self.shared.transition(AgentStatus::Idle)?;
        info!("agent {} reset to idle", self.shared.id);
        Ok(())
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.shared.capabilities.read().clone()
    }

    pub fn has_capability(&self, kind: &CapabilityKind) -> bool {
        self.shared.capabilities.read().contains(kind)
    }

    /// Returns the superseded capability of the same kind, if any.
    pub fn add_capability(&self, cap: Capability) -> Result<Option<Capability>, AgentError> {
        let kind = cap.kind.clone();
        let replaced = self.shared.capabilities.write().add(cap)?;
        debug!("agent {}: capability {} added", self.shared.id, kind);
        Ok(replaced)
    }

    pub fn remove_capability(&self, kind: &CapabilityKind) -> Result<Capability, AgentError> {
        self.shared.capabilities.write().remove(kind)
    }

    /// Current performance snapshot; `load` is the live mailbox depth.
    pub fn performance(&self) -> PerformanceSnapshot {
        let mut snapshot = self.shared.performance.lock().clone();
        snapshot.load = self.load();
        snapshot
    }

    /// Seed the snapshot, e.g. when an agent is recreated from a predecessor.
    pub fn set_performance(&self, snapshot: PerformanceSnapshot) {
        *self.shared.performance.lock() = snapshot;
    }

    /// Record an outcome observed outside the mailbox (e.g. by a router).
    pub fn record_outcome(&self, latency: Duration, success: bool) {
        self.shared.performance.lock().record(latency, success);
    }

    pub fn load(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn diary(&self) -> Vec<DiaryEntry> {
        self.shared.diary.entries()
    }

    pub async fn flush_diary(&self) -> Result<usize, StoreError> {
        self.shared.diary.flush().await
    }

    /// Deliver `message` and wait for the reply.
    ///
    /// Bounded by `timeout` (covering both the wait for mailbox space and the
    /// handler itself) and by `cancel`. On expiry the delivery is abandoned
    /// and the handler, if already running, observes cancellation.
    pub async fn send(
        &self,
        message: Message,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Message, ExecutionError> {
        let status = self.status();
        if matches!(status, AgentStatus::ShuttingDown | AgentStatus::Terminated) {
            return Err(ExecutionError::CommunicationFailure(format!(
                "agent {} is {}",
                self.shared.id, status
            )));
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let token = cancel.child_token();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            message,
            deadline,
            cancel: token.clone(),
            reply: reply_tx,
            _load: LoadGuard::new(self.shared.clone()),
        };

        let closed = || ExecutionError::CommunicationFailure(format!("mailbox closed for agent {}", self.shared.id));
        let delivery = async {
            self.tx
                .send(Command::Deliver(envelope))
                .await
                .map_err(|_| closed())?;
            reply_rx.await.map_err(|_| closed())?
        };

        let result = tokio::select! {
            r = delivery => r,
            _ = token.cancelled() => Err(ExecutionError::Cancelled(format!(
                "delivery to {} cancelled",
                self.shared.id
            ))),
            _ = sleep_until(deadline) => Err(ExecutionError::timeout(
                format!("delivery to {}", self.shared.id),
                timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            )),
        };
        if result.is_err() {
            token.cancel();
        }
        result
    }

    /// Stop the agent after any in-flight delivery completes.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Mailbox task
// ---------------------------------------------------------------------------

async fn run_mailbox(shared: Arc<Shared>, mut agent: Box<dyn Agent>, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Deliver(envelope) => {
                deliver(&shared, agent.as_mut(), envelope).await;
                let _ = shared.diary.flush().await;
            }
            Command::Shutdown(done) => {
                stop(&shared, agent.as_mut()).await;
                let _ = done.send(());
                return;
            }
        }
    }
    stop(&shared, agent.as_mut()).await;
}

async fn stop(shared: &Shared, agent: &mut dyn Agent) {
    if shared.transition(AgentStatus::ShuttingDown).is_ok() {
        agent.shutdown().await;
        let _ = shared.transition(AgentStatus::Terminated);
    }
    let _ = shared.diary.flush().await;
    info!("agent {} stopped ({})", shared.id, shared.status());
}

async fn deliver(shared: &Shared, agent: &mut dyn Agent, envelope: Envelope) {
    let Envelope {
        message,
        deadline,
        cancel,
        reply,
        _load,
    } = envelope;
    shared.diary.record(DiaryKind::Received, message.summary());

    if cancel.is_cancelled() {
        let _ = reply.send(Err(ExecutionError::Cancelled(format!(
            "delivery {} abandoned before processing",
            message.id
        ))));
        return;
    }
    let status = shared.status();
    if status != AgentStatus::Idle {
        let err = ExecutionError::StateCorruption(format!("agent {} is {}", shared.id, status));
        shared.diary.record(DiaryKind::Failure, err.to_string());
        let _ = reply.send(Err(err));
        return;
    }
    if let Err(e) = shared.transition(AgentStatus::Processing) {
        let _ = reply.send(Err(corrupted(e)));
        return;
    }

    let ctx = HandlerContext {
        agent_id: shared.id.clone(),
        cancel: cancel.clone(),
    };
    let started = Instant::now();
    let handled = async {
        match deadline {
            Some(at) => match tokio::time::timeout_at(at, agent.handle(&ctx, message)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timeout(
                    format!("agent {} handler", shared.id),
                    started.elapsed().as_millis() as u64,
                )),
            },
            None => agent.handle(&ctx, message).await,
        }
    };
    let mut outcome = tokio::select! {
        r = handled => r,
        _ = cancel.cancelled() => Err(ExecutionError::Cancelled(format!(
            "agent {} handler cancelled",
            shared.id
        ))),
    };
    let elapsed = started.elapsed();
    // a caller that hit its deadline cancels; report that as the timeout it is
    if let (Err(ExecutionError::Cancelled(_)), Some(at)) = (&outcome, deadline) {
        if Instant::now() >= at {
            outcome = Err(ExecutionError::timeout(
                format!("agent {} handler", shared.id),
                elapsed.as_millis() as u64,
            ));
        }
    }

    if !matches!(outcome, Err(ExecutionError::Cancelled(_))) {
        shared.performance.lock().record(elapsed, outcome.is_ok());
    }
    let next = match &outcome {
        Err(ExecutionError::StateCorruption(_)) => AgentStatus::Error,
        _ => AgentStatus::Idle,
    };
    match &outcome {
        Ok(response) => {
            shared.diary.record(DiaryKind::Sent, response.summary());
        }
        Err(e) => {
            shared.diary.record(DiaryKind::Failure, e.to_string());
            debug!("agent {}: handler failed: {}", shared.id, e);
        }
    }
    let _ = shared.transition(next);
    let _ = reply.send(outcome);
}
