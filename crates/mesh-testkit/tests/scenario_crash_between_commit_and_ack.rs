//! Scenario: Crash Between Commit and Ack
//!
//! # Invariant under test
//! At-least-once delivery with exactly-once materialization: when a
//! coordinator dies after the engine commit but before the ack, the rows
//! requeue and the next claim short-circuits: the engine reports the token
//! range as already durable, the coordinator acks without re-applying, and
//! the row count stays at one application.

use std::time::Duration;

use serde_json::json;

use mesh_bus::IngestBus;
use mesh_engine::{apply_batch, CommitOutcome, TableEngine};
use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

#[tokio::test]
async fn requeued_batch_short_circuits_after_durable_commit() {
    let h = MeshHarness::new();

    for n in 0..3 {
        h.publish_one(MeshHarness::event(
            "t1",
            "trades",
            &format!("k{n}"),
            RowOp::Insert,
            json!({"n": n}),
        ))
        .await
        .unwrap();
    }

    // A doomed consumer claims, applies, commits... and dies before ack.
    let doomed = h.bus.claim_batch("doomed", 10, 0).await.unwrap();
    assert_eq!(doomed.envelopes.len(), 3);
    let mut txn = h.engine.begin("t1").await.unwrap();
    apply_batch(txn.as_mut(), &doomed.envelopes).unwrap();
    let outcome = txn
        .commit(doomed.batch_id, doomed.token_ceiling, doomed.event_ids(), false)
        .await
        .unwrap();
    assert!(matches!(outcome, CommitOutcome::Committed(_)));
    // No ack: the "crash".
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(h.bus.requeue_expired().await.unwrap() >= 3);

    // Recovery: the real coordinator attaches and drains the requeue.
    h.start("t1");
    assert!(h.wait_visible("t1", doomed.token_ceiling).await);

    let count = h.count("t1", "trades").await.unwrap();
    assert_eq!(count, 3, "each envelope materialized exactly once");

    let records = h.engine.records("t1").await.unwrap();
    assert_eq!(records.len(), 1, "no second record for the re-claim");

    // The rows settled at the bus too: nothing left to claim.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let depth = h.bus.depth("t1").await.unwrap();
    assert_eq!(depth.pending_rows, 0);

    h.shutdown().await;
}

#[tokio::test]
async fn watermark_rehydrates_from_the_event_store() {
    let h = MeshHarness::new();

    // Commit one batch by hand, then pretend the process restarted: the
    // registry starts cold and must recover the watermark at attach.
    let r = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "k1",
            RowOp::Insert,
            json!({"x": 1}),
        ))
        .await
        .unwrap();
    let batch = h.bus.claim_batch("consumer-a", 10, 30).await.unwrap();
    let mut txn = h.engine.begin("t1").await.unwrap();
    apply_batch(txn.as_mut(), &batch.envelopes).unwrap();
    txn.commit(batch.batch_id, batch.token_ceiling, batch.event_ids(), false)
        .await
        .unwrap();
    h.bus.ack(batch.batch_id, &batch.event_ids()).await.unwrap();

    assert_eq!(h.watermarks.current("t1"), 0, "registry is cold");

    h.start("t1");
    assert!(
        h.wait_visible("t1", r.visibility_token).await,
        "attach must rehydrate the watermark from max committed token"
    );

    h.shutdown().await;
}
