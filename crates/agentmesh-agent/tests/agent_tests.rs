//! Tests for agentmesh-agent: lifecycle, mailbox serialization, deadlines, diary, remote adapter

use agentmesh_agent::*;
use agentmesh_core::*;
use agentmesh_kg::{iri, lit, var, MemoryStore, Query, TripleStore};
use std::result::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Echoes the payload after an optional delay, tracking peak concurrency.
struct Worker {
    delay: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Worker {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait::async_trait]
impl Agent for Worker {
    fn agent_type(&self) -> &str {
        "worker"
    }

    async fn handle(&mut self, ctx: &HandlerContext, message: Message) -> Result<Message, ExecutionError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        match message.payload.get("fail").and_then(|v| v.as_str()) {
            Some("corrupt") => Err(ExecutionError::StateCorruption("bad state".into())),
            Some(other) => Err(ExecutionError::application(other)),
            None => Ok(message.reply(&ctx.agent_id, message.payload.clone())),
        }
    }
}

struct FailsToStart;

#[async_trait::async_trait]
impl Agent for FailsToStart {
    fn agent_type(&self) -> &str {
        "broken"
    }

    async fn initialize(&mut self) -> Result<(), ExecutionError> {
        Err(ExecutionError::ResourceExhaustion("no model loaded".into()))
    }

    async fn handle(&mut self, _: &HandlerContext, _: Message) -> Result<Message, ExecutionError> {
        unreachable!()
    }
}

fn caps(kinds: &[&str]) -> CapabilitySet {
    let mut set = CapabilitySet::new();
    for k in kinds {
        set.add(Capability::new(*k, "1.0")).unwrap();
    }
    set
}

fn request(payload: serde_json::Value) -> Message {
    Message::request("tester", Recipient::Capability("echo".into()), payload)
}

async fn spawn(id: &str, agent: impl Agent) -> AgentHandle {
    AgentHandle::spawn(id, Box::new(agent), caps(&["echo"]), RuntimeOptions::default())
        .await
        .unwrap()
}

// ===========================================================================
// Lifecycle
// ===========================================================================

#[tokio::test]
async fn spawn_reaches_idle_and_replies() {
    let handle = spawn("a1", Worker::new(0)).await;
    assert_eq!(handle.status(), AgentStatus::Idle);
    let msg = request(serde_json::json!({"n": 1}));
    let reply = handle.send(msg.clone(), None, &CancellationToken::new()).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.correlation_id.as_ref(), Some(&msg.id));
    assert_eq!(reply.payload["n"], 1);
    assert_eq!(handle.status(), AgentStatus::Idle);
    assert_eq!(handle.performance().processed, 1);
}

#[tokio::test]
async fn initialization_failure_returns_error() {
    let err = AgentHandle::spawn("b1", Box::new(FailsToStart), CapabilitySet::new(), RuntimeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::ResourceExhaustion);
}

#[tokio::test]
async fn invalid_transition_forces_error_and_is_recorded() {
    let handle = spawn("a1", Worker::new(0)).await;
    let err = handle.transition(AgentStatus::Terminated).unwrap_err();
    assert!(matches!(err, AgentError::InvalidStateTransition { .. }));
    assert_eq!(handle.status(), AgentStatus::Error);
    assert!(handle
        .diary()
        .iter()
        .any(|e| e.kind == DiaryKind::Failure && e.summary.contains("idle -> terminated")));
}

#[tokio::test]
async fn state_corruption_moves_to_error_until_reset() {
    let handle = spawn("a1", Worker::new(0)).await;
    let cancel = CancellationToken::new();
    let err = handle
        .send(request(serde_json::json!({"fail": "corrupt"})), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::StateCorruption);
    assert_eq!(handle.status(), AgentStatus::Error);
    assert!(!handle.is_routable());

    assert!(handle.send(request(serde_json::json!({})), None, &cancel).await.is_err());
    handle.reset().unwrap();
    assert!(handle.send(request(serde_json::json!({})), None, &cancel).await.is_ok());
}

#[tokio::test]
async fn application_error_returns_to_idle() {
    let handle = spawn("a1", Worker::new(0)).await;
    let err = handle
        .send(request(serde_json::json!({"fail": "bad input"})), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, ExecutionError::application("bad input"));
    assert_eq!(handle.status(), AgentStatus::Idle);
    assert_eq!(handle.performance().failed, 1);
}

#[tokio::test]
async fn reset_is_refused_unless_in_error() {
    let handle = spawn("a1", Worker::new(0)).await;
    assert!(handle.reset().is_err());
    assert_eq!(handle.status(), AgentStatus::Idle);
}

#[tokio::test]
async fn shutdown_terminates_and_refuses_delivery() {
    let handle = spawn("a1", Worker::new(0)).await;
    handle.shutdown().await;
    assert_eq!(handle.status(), AgentStatus::Terminated);
    let err = handle
        .send(request(serde_json::json!({})), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::CommunicationFailure);
}

#[tokio::test]
async fn same_kind_capability_is_replaced() {
    let handle = spawn("a1", Worker::new(0)).await;
    let old = handle.add_capability(Capability::new("echo", "2.0")).unwrap();
    assert_eq!(old.map(|c| c.version), Some("1.0".to_string()));
    let held = handle.capabilities();
    assert_eq!(held.len(), 1);
    assert_eq!(held.get(&"echo".into()).map(|c| c.version.as_str()), Some("2.0"));
}

// ===========================================================================
// Scheduling
// ===========================================================================

#[tokio::test]
async fn one_agent_handles_messages_one_at_a_time() {
    let worker = Worker::new(20);
    let peak = worker.peak.clone();
    let handle = spawn("a1", worker).await;
    let cancel = CancellationToken::new();
    let sends = (0..5).map(|i| {
        let handle = handle.clone();
        let cancel = cancel.clone();
        async move { handle.send(request(serde_json::json!({"i": i})), None, &cancel).await }
    });
    let results = futures::future::join_all(sends).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn distinct_agents_run_concurrently() {
    let a = spawn("a1", Worker::new(200)).await;
    let b = spawn("a2", Worker::new(200)).await;
    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();
    let (ra, rb) = tokio::join!(
        a.send(request(serde_json::json!({})), None, &cancel),
        b.send(request(serde_json::json!({})), None, &cancel)
    );
    assert!(ra.is_ok() && rb.is_ok());
    assert!(started.elapsed() < Duration::from_millis(380));
}

#[tokio::test]
async fn deadline_expiry_is_a_timeout_failure() {
    let handle = spawn("a1", Worker::new(500)).await;
    let err = handle
        .send(request(serde_json::json!({})), Some(Duration::from_millis(50)), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Timeout);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handle.status(), AgentStatus::Idle);
    assert_eq!(handle.performance().failed, 1);
    assert_eq!(handle.load(), 0);
}

#[tokio::test]
async fn cancellation_aborts_delivery() {
    let handle = spawn("a1", Worker::new(500)).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });
    let err = handle
        .send(request(serde_json::json!({})), None, &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Cancelled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // cancellation is not held against the agent
    assert_eq!(handle.performance().failed, 0);
}

// ===========================================================================
// Diary persistence
// ===========================================================================

#[tokio::test]
async fn diary_is_persisted_into_the_store() {
    let store = Arc::new(MemoryStore::new());
    let options = RuntimeOptions::default().with_store(store.clone());
    let handle = AgentHandle::spawn("a1", Box::new(Worker::new(0)), caps(&["echo"]), options)
        .await
        .unwrap();
    handle
        .send(request(serde_json::json!({})), None, &CancellationToken::new())
        .await
        .unwrap();
    handle.flush_diary().await.unwrap();

    let q = Query::select(["e", "k"])
        .instances_of("e", DIARY_ENTRY_CLASS)
        .pattern(var("e"), iri("mesh:agent"), iri("agent:a1"))
        .pattern(var("e"), iri("mesh:kind"), var("k"));
    let rows = store.execute_query(&q, None).await.unwrap();
    assert_eq!(rows.len(), handle.diary().len());

    let sent = Query::select(["e"]).pattern(var("e"), iri("mesh:kind"), lit("sent"));
    assert_eq!(store.execute_query(&sent, None).await.unwrap().len(), 1);
}

// ===========================================================================
// Remote adapter
// ===========================================================================

#[tokio::test]
async fn remote_agent_forwards_through_the_runtime() {
    use axum::{routing::post, Json, Router};

    async fn echo(Json(message): Json<Message>) -> Json<Message> {
        let payload = message.payload.clone();
        Json(message.reply(&AgentId::new("remote"), serde_json::json!({ "echo": payload })))
    }
    async fn refuse(Json(message): Json<Message>) -> Json<Message> {
        Json(message.error_reply(&AgentId::new("remote"), "quota exceeded"))
    }

    let app = Router::new().route("/echo", post(echo)).route("/refuse", post(refuse));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let cancel = CancellationToken::new();
    let echo_agent = spawn("r1", RemoteAgent::new("remote", format!("http://{}/echo", addr))).await;
    let reply = echo_agent
        .send(request(serde_json::json!({"x": 1})), Some(Duration::from_secs(5)), &cancel)
        .await
        .unwrap();
    assert_eq!(reply.payload["echo"]["x"], 1);

    let refusing = spawn("r2", RemoteAgent::new("remote", format!("http://{}/refuse", addr))).await;
    let err = refusing
        .send(request(serde_json::json!({})), Some(Duration::from_secs(5)), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, ExecutionError::application("quota exceeded"));
}
