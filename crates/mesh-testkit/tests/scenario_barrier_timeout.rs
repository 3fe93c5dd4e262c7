//! Scenario: Barrier Timeout
//!
//! # Invariant under test
//! A query whose `min_visibility_token` the watermark never reaches returns
//! `BarrierTimeout` within `timeout + epsilon`, carrying the observed
//! watermark so the caller can decide to retry or relax.

use std::time::{Duration, Instant};

use serde_json::json;

use mesh_query::{QueryError, QueryOpts};
use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

#[tokio::test]
async fn paused_coordinator_trips_the_barrier() {
    let h = MeshHarness::new();
    // No h.start(): the coordinator stays paused, the watermark never moves.

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

    let started = Instant::now();
    let err = h
        .gate
        .query(
            "t1",
            "select count(*) from trades",
            QueryOpts {
                min_visibility_token: Some(r.visibility_token),
                barrier_timeout_ms: Some(100),
            },
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        QueryError::BarrierTimeout {
            min_visibility_token,
            observed,
        } => {
            assert_eq!(min_visibility_token, r.visibility_token);
            assert_eq!(observed, 0, "nothing was ever published");
        }
        other => panic!("expected BarrierTimeout, got {other}"),
    }
    assert!(
        elapsed < Duration::from_secs(1),
        "barrier must be bounded; waited {elapsed:?}"
    );
}

#[tokio::test]
async fn barrier_timeout_reports_observed_watermark() {
    let h = MeshHarness::new();
    h.start("t1");

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
    assert!(h.wait_visible("t1", r.visibility_token).await);
    let published = h.watermarks.current("t1");

    // One past the watermark can never be reached while ingest is quiet.
    let err = h
        .gate
        .query(
            "t1",
            "select count(*) from trades",
            QueryOpts {
                min_visibility_token: Some(published + 1),
                barrier_timeout_ms: Some(100),
            },
        )
        .await
        .unwrap_err();

    match err {
        QueryError::BarrierTimeout { observed, .. } => {
            assert_eq!(observed, published);
        }
        other => panic!("expected BarrierTimeout, got {other}"),
    }

    h.shutdown().await;
}

#[tokio::test]
async fn relaxed_query_never_waits() {
    let h = MeshHarness::new();

    let started = Instant::now();
    let resp = h
        .gate
        .query("t1", "select count(*) from trades", QueryOpts::default())
        .await
        .unwrap();
    assert_eq!(resp.snapshot_token, 0);
    assert!(started.elapsed() < Duration::from_millis(500));
}
