//! Tests for agentmesh-kg: indices, cache coherence, subclass reasoning, remote backend

use agentmesh_core::StoreError;
use agentmesh_kg::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn cached() -> CachedStore<MemoryStore> {
    CachedStore::new(MemoryStore::new(), 64, Duration::from_secs(60))
}

fn readings(n: i64) -> Vec<Triple> {
    (0..n)
        .flat_map(|i| {
            let s = format!("ex:dev{}", i);
            [
                Triple::typed(s.as_str(), "ex:Device"),
                Triple::new(s.as_str(), "ex:reading", i),
                Triple::new(s.as_str(), "ex:attachedTo", Iri::new("ex:hub")),
            ]
        })
        .collect()
}

async fn spawn_endpoint(store: Arc<dyn TripleStore>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, server::router(store)).await.unwrap();
    });
    addr
}

// ===========================================================================
// Index and cache round-trip
// ===========================================================================

#[tokio::test]
async fn insert_then_remove_restores_indices_and_cached_results() {
    let store = cached();
    store
        .apply_update(&Update::inserting([Triple::typed("ex:base", "ex:Device")]), None)
        .await
        .unwrap();

    let q = Query::select(["d"]).instances_of("d", "ex:Device");
    let before_rows = store.execute_query(&q, None).await.unwrap();
    let before_index = store.inner().index_snapshot();

    let batch = readings(20);
    store.apply_update(&Update::inserting(batch.clone()), None).await.unwrap();
    assert_eq!(store.execute_query(&q, None).await.unwrap().len(), 21);

    store.apply_update(&Update::removing(batch), None).await.unwrap();
    assert_eq!(store.inner().index_snapshot(), before_index);
    assert_eq!(store.execute_query(&q, None).await.unwrap(), before_rows);
}

#[tokio::test]
async fn repeated_query_after_mutation_is_never_stale() {
    let store = cached();
    let q = Query::parse("SELECT ?r WHERE { ex:dev0 ex:reading ?r }").unwrap();
    store
        .apply_update(&Update::new().insert(Triple::new("ex:dev0", "ex:reading", 1i64)), None)
        .await
        .unwrap();
    assert_eq!(store.execute_query(&q, None).await.unwrap()[0].get("r"), Some(&Value::Int(1)));
    // second read is a hit
    store.execute_query(&q, None).await.unwrap();
    assert_eq!(store.cache().stats().hits, 1);

    store
        .apply_update(
            &Update::new()
                .remove(Triple::new("ex:dev0", "ex:reading", 1i64))
                .insert(Triple::new("ex:dev0", "ex:reading", 2i64)),
            None,
        )
        .await
        .unwrap();
    let rows = store.execute_query(&q, None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("r"), Some(&Value::Int(2)));
}

#[tokio::test]
async fn unrelated_writes_keep_cached_results() {
    let store = cached();
    store.apply_update(&Update::inserting(readings(2)), None).await.unwrap();
    let q = Query::parse("SELECT ?r WHERE { ?d ex:reading ?r }").unwrap();
    store.execute_query(&q, None).await.unwrap();

    // diary-style traffic on other predicates, plus a write that changes nothing
    store
        .apply_update(&Update::inserting([Triple::new("agent:a1/diary/1", "mesh:event", "idle")]), None)
        .await
        .unwrap();
    store.apply_update(&Update::inserting(readings(1)), None).await.unwrap();
    assert_eq!(store.execute_query(&q, None).await.unwrap().len(), 2);
    assert_eq!(store.cache().stats().hits, 1);

    store
        .apply_update(&Update::inserting([Triple::new("ex:dev9", "ex:reading", 9i64)]), None)
        .await
        .unwrap();
    assert_eq!(store.execute_query(&q, None).await.unwrap().len(), 3);
    assert_eq!(store.cache().stats().hits, 1);
}

#[tokio::test]
async fn whitespace_variants_share_a_cache_entry() {
    let store = cached();
    store
        .apply_update(&Update::inserting(readings(3)), None)
        .await
        .unwrap();
    let a = Query::parse("SELECT ?d WHERE { ?d a ex:Device }").unwrap();
    let b = Query::parse("SELECT  ?d  WHERE {?d a <ex:Device>}").unwrap();
    store.execute_query(&a, None).await.unwrap();
    store.execute_query(&b, None).await.unwrap();
    let stats = store.cache().stats();
    assert_eq!((stats.hits, stats.misses), (1, 1));
}

// ===========================================================================
// Subclass reasoning
// ===========================================================================

#[tokio::test]
async fn subtype_instances_appear_in_supertype_queries() {
    let store = cached();
    store
        .apply_update(
            &Update::inserting([
                Triple::subclass("ex:TemperatureSensor", "ex:Sensor"),
                Triple::typed("ex:plain", "ex:Sensor"),
            ]),
            None,
        )
        .await
        .unwrap();
    let q = Query::select(["x"]).instances_of("x", "ex:Sensor");
    assert_eq!(store.execute_query(&q, None).await.unwrap().len(), 1);

    store
        .apply_update(&Update::new().insert(Triple::typed("ex:x", "ex:TemperatureSensor")), None)
        .await
        .unwrap();
    let rows = store.execute_query(&q, None).await.unwrap();
    let found: Vec<_> = rows.iter().filter_map(|r| r.get("x")).collect();
    assert!(found.contains(&&Value::Ref("ex:x".into())));
    assert_eq!(found.len(), 2);
}

#[tokio::test]
async fn values_come_back_in_declared_types() {
    let store = MemoryStore::new();
    store
        .apply_update(
            &Update::inserting([
                Triple::new("ex:a", "ex:count", 3i64),
                Triple::new("ex:a", "ex:ratio", 0.5),
                Triple::new("ex:a", "ex:enabled", true),
                Triple::new("ex:a", "ex:label", "three"),
            ]),
            None,
        )
        .await
        .unwrap();
    let rows = store
        .execute_query(&Query::select(["p", "o"]).pattern(iri("ex:a"), var("p"), var("o")), None)
        .await
        .unwrap();
    let objects: Vec<_> = rows.iter().filter_map(|r| r.get("o").cloned()).collect();
    assert_eq!(
        objects,
        vec![
            Value::Int(3),
            Value::Float(0.5),
            Value::Bool(true),
            Value::Str("three".into())
        ]
    );
}

// ===========================================================================
// Remote backend over the HTTP endpoint
// ===========================================================================

#[tokio::test]
async fn remote_backend_matches_in_process_semantics() {
    let local: Arc<dyn TripleStore> = Arc::new(MemoryStore::new());
    let addr = spawn_endpoint(local.clone()).await;
    let remote = RemoteStore::new(format!("http://{}", addr));

    let receipt = remote
        .apply_update(
            &Update::inserting([
                Triple::subclass("ex:Thermometer", "ex:Sensor"),
                Triple::typed("ex:t1", "ex:Thermometer"),
                Triple::new("ex:t1", "ex:reading", 21.5).with_provenance("test"),
            ]),
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();
    assert_eq!(receipt.inserted.len(), 3);
    assert_eq!(receipt.inserted[2].provenance.as_deref(), Some("test"));

    let q = Query::select(["s", "r"])
        .instances_of("s", "ex:Sensor")
        .pattern(var("s"), iri("ex:reading"), var("r"));
    let remote_rows = remote.execute_query(&q, Some(Duration::from_secs(5))).await.unwrap();
    let local_rows = local.execute_query(&q, None).await.unwrap();
    assert_eq!(remote_rows, local_rows);
    assert_eq!(remote_rows[0].get("r"), Some(&Value::Float(21.5)));

    let undo = remote.apply_update(&receipt.inverse(), None).await.unwrap();
    assert_eq!(undo.removed.len(), 3);
    assert!(local.execute_query(&q, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_parse_error_keeps_position() {
    let addr = spawn_endpoint(Arc::new(MemoryStore::new())).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/query", addr))
        .json(&serde_json::json!({"query": "SELECT ?x WHERE { ?x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["position"].is_u64());
}

#[tokio::test]
async fn unreachable_endpoint_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let remote = RemoteStore::new(format!("http://{}", addr));
    let err = remote
        .execute_query(&Query::default().pattern(var("s"), var("p"), var("o")), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Network(_)), "got {:?}", err);
}

struct SlowStore;

#[async_trait::async_trait]
impl TripleStore for SlowStore {
    async fn execute_query(&self, _: &Query, _: Option<Duration>) -> Result<Vec<BindingRow>, StoreError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }

    async fn apply_update(&self, _: &Update, _: Option<Duration>) -> Result<UpdateReceipt, StoreError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(UpdateReceipt::default())
    }

    fn location(&self) -> String {
        "slow".into()
    }
}

#[tokio::test]
async fn remote_call_is_bounded_by_caller_timeout() {
    let addr = spawn_endpoint(Arc::new(SlowStore)).await;
    let remote = RemoteStore::new(format!("http://{}", addr));
    let started = std::time::Instant::now();
    let err = remote
        .execute_query(&Query::default().pattern(var("s"), var("p"), var("o")), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(2));
}
