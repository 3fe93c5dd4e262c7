//! Scenario: Publish Dedup
//!
//! # Invariant under test
//! A redelivered event (same tenant, table, idempotency key, event time)
//! produces one materialization: the second result has `inserted = false`
//! and carries the existing row's event_id and reservation. A later version
//! of the same row is a new event, but still one materialized row.

use serde_json::json;

use mesh_schemas::{Envelope, RowOp};
use mesh_testkit::MeshHarness;

fn redelivery_of(env: &Envelope) -> Envelope {
    let mut retry = env.clone();
    retry.event_id = format!("{}-retry", env.event_id);
    retry
}

#[tokio::test]
async fn redelivered_event_materializes_once() {
    let h = MeshHarness::new();
    h.start("t1");

    let original = MeshHarness::event("t1", "trades", "k1", RowOp::Insert, json!({"x": 1}));
    let first = h.publish_one(original.clone()).await.unwrap();
    assert!(first.inserted);

    let second = h.publish_one(redelivery_of(&original)).await.unwrap();
    assert!(!second.inserted, "redelivery must dedup");
    assert_eq!(second.event_id, first.event_id);
    assert_eq!(second.visibility_token, first.visibility_token);

    assert!(h.wait_visible("t1", first.visibility_token).await);
    let count = h.count("t1", "trades").await.unwrap();
    assert_eq!(count, 1, "dedup means exactly one materialized row");

    h.shutdown().await;
}

#[tokio::test]
async fn duplicate_hint_still_satisfies_strict_read() {
    let h = MeshHarness::new();
    h.start("t1");

    let original = MeshHarness::event("t1", "trades", "k1", RowOp::Upsert, json!({"x": 1}));
    let first = h.publish_one(original.clone()).await.unwrap();
    assert!(h.wait_visible("t1", first.visibility_token).await);

    // Redelivery after the original committed: its hint is the original
    // reservation, already covered by the watermark.
    let dup = h.publish_one(redelivery_of(&original)).await.unwrap();
    assert!(!dup.inserted);
    let count = h.count_at("t1", "trades", dup.visibility_token).await.unwrap();
    assert_eq!(count, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn new_row_version_is_one_materialization() {
    let h = MeshHarness::new();
    h.start("t1");

    let mut v1 = MeshHarness::event("t1", "trades", "k1", RowOp::Upsert, json!({"v": 1}));
    v1.event_time_unix_ms = 1_700_000_000_000;
    let mut v2 = MeshHarness::event("t1", "trades", "k1", RowOp::Upsert, json!({"v": 2}));
    v2.event_time_unix_ms = 1_700_000_001_000;

    let r1 = h.publish_one(v1).await.unwrap();
    let r2 = h.publish_one(v2).await.unwrap();
    assert!(r1.inserted && r2.inserted, "distinct versions both insert");

    assert!(h.wait_visible("t1", r2.visibility_token).await);
    let count = h.count("t1", "trades").await.unwrap();
    assert_eq!(count, 1, "upsert keyed by idempotency_key: one row");

    h.shutdown().await;
}
