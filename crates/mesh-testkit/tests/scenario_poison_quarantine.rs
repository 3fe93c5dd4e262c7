//! Scenario: Poison Quarantine and Tombstone
//!
//! # Invariant under test
//! A batch that can never materialize burns its attempts, lands in FAILED,
//! and the coordinator publishes a tombstone record at the batch's token
//! ceiling. The watermark advances past the poison tokens, so strict
//! readers holding those hints are released (to an empty result) and
//! unrelated subsequent events stay queryable. Forward progress is never
//! lost to a poison batch.

use std::time::Duration;

use serde_json::json;

use mesh_bus::IngestBus;
use mesh_config::CoreConfig;
use mesh_engine::TableEngine;
use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

fn poison_cfg() -> CoreConfig {
    CoreConfig {
        max_attempts: 3,
        idle_poll_ms: 10,
        ..CoreConfig::default()
    }
}

#[tokio::test]
async fn poison_batch_tombstones_and_watermark_advances() {
    let h = MeshHarness::with_config(poison_cfg());
    h.start("t1");

    // Payload is not a row object: fails schema validation on every attempt.
    let poison = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "bad",
            RowOp::Insert,
            json!("not-a-row"),
        ))
        .await
        .unwrap();

    // The tombstone must cover the poison reservation.
    assert!(
        h.wait_visible("t1", poison.visibility_token).await,
        "watermark must advance past the quarantined batch"
    );

    let records = h.engine.records("t1").await.unwrap();
    let tombstones: Vec<_> = records.iter().filter(|r| r.tombstone).collect();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].visibility_token, poison.visibility_token);
    assert_eq!(tombstones[0].event_ids, vec![poison.event_id.clone()]);

    // Nothing materialized from the poison batch.
    let count = h.count("t1", "trades").await.unwrap();
    assert_eq!(count, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn events_after_a_poison_batch_stay_queryable() {
    let h = MeshHarness::with_config(poison_cfg());
    h.start("t1");

    let poison = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "bad",
            RowOp::Insert,
            json!(42),
        ))
        .await
        .unwrap();
    assert!(h.wait_visible("t1", poison.visibility_token).await);

    let good = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "good",
            RowOp::Insert,
            json!({"x": 1}),
        ))
        .await
        .unwrap();
    assert!(good.visibility_token > poison.visibility_token);

    let count = h.count_at("t1", "trades", good.visibility_token).await.unwrap();
    assert_eq!(count, 1, "the good event lands past the tombstone");

    h.shutdown().await;
}

#[tokio::test]
async fn quarantine_consumes_exactly_max_attempts() {
    let h = MeshHarness::with_config(poison_cfg());
    h.start("t1");

    let poison = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "bad",
            RowOp::Upsert,
            json!([1, 2, 3]),
        ))
        .await
        .unwrap();
    assert!(h.wait_visible("t1", poison.visibility_token).await);

    // Give the loop a beat to settle, then confirm the queue is at rest:
    // the row is FAILED and resolved, not cycling.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let depth = h.bus.depth("t1").await.unwrap();
    assert_eq!(depth.pending_rows, 0, "no accepted or claimed rows remain");

    let nacks = h
        .metrics()
        .batches_nacked
        .load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(nacks, 3, "one nack per attempt, then quarantine");

    h.shutdown().await;
}
