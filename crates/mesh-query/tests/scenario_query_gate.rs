//! Scenario: Query Gate
//!
//! # Invariant under test
//! The gate waits only when asked, applies the default barrier timeout when
//! the caller supplies none, reports the snapshot token it executed at, and
//! rejects SQL outside the engine surface without opening a snapshot leak.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use uuid::Uuid;

use mesh_engine::{EngineTxn, MemoryEngine, TableEngine};
use mesh_query::{QueryError, QueryGate, QueryOpts};
use mesh_schemas::RowOp;
use mesh_watermark::WatermarkRegistry;

async fn seed(engine: &MemoryEngine, registry: &WatermarkRegistry, token: i64) {
    let mut txn = engine.begin("t1").await.unwrap();
    txn.apply("trades", RowOp::Insert, &format!("k{token}"), &json!({"x": token}), token)
        .unwrap();
    txn.commit(Uuid::new_v4(), token, vec![format!("e{token}")], false)
        .await
        .unwrap();
    registry.publish("t1", token);
}

fn gate(engine: &MemoryEngine, registry: &Arc<WatermarkRegistry>, default_ms: u64) -> QueryGate {
    QueryGate::new(
        Arc::new(engine.clone()),
        Arc::clone(registry),
        Duration::from_millis(default_ms),
    )
}

#[tokio::test]
async fn snapshot_token_reflects_the_watermark_at_execution() {
    let engine = MemoryEngine::new();
    let registry = Arc::new(WatermarkRegistry::new());
    seed(&engine, &registry, 1).await;
    seed(&engine, &registry, 2).await;

    let gate = gate(&engine, &registry, 5_000);
    let resp = gate
        .query("t1", "select count(*) from trades", QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(resp.snapshot_token, 2);
    assert_eq!(resp.rows[0][0], json!(2));
}

#[tokio::test]
async fn default_timeout_applies_when_caller_gives_none() {
    let engine = MemoryEngine::new();
    let registry = Arc::new(WatermarkRegistry::new());

    let gate = gate(&engine, &registry, 100);
    let started = Instant::now();
    let err = gate
        .query(
            "t1",
            "select count(*) from trades",
            QueryOpts {
                min_visibility_token: Some(10),
                barrier_timeout_ms: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::BarrierTimeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn rejected_sql_does_not_leak_a_pin() {
    let engine = MemoryEngine::new();
    let registry = Arc::new(WatermarkRegistry::new());
    seed(&engine, &registry, 1).await;

    let gate = gate(&engine, &registry, 5_000);
    let err = gate
        .query("t1", "update trades set x = 1", QueryOpts::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::Rejected(_)));
    assert_eq!(engine.pinned_count("t1"), 0);
}

#[tokio::test]
async fn satisfied_barrier_returns_immediately() {
    let engine = MemoryEngine::new();
    let registry = Arc::new(WatermarkRegistry::new());
    seed(&engine, &registry, 3).await;

    let gate = gate(&engine, &registry, 5_000);
    let started = Instant::now();
    let resp = gate
        .query(
            "t1",
            "select count(*) from trades",
            QueryOpts {
                min_visibility_token: Some(3),
                barrier_timeout_ms: Some(30_000),
            },
        )
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(resp.snapshot_token, 3);
}
