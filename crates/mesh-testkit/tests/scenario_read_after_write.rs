//! Scenario: Read-After-Write
//!
//! # Invariant under test
//! If publish returns hint `h`, a query with `min_visibility_token = h` and
//! a sufficient timeout observes the event's effect. The hint is always >=
//! the token the event ultimately receives, so waiting on it is sufficient.

use serde_json::json;

use mesh_engine::TableEngine;
use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

#[tokio::test]
async fn publish_then_strict_read_sees_the_row() {
    let h = MeshHarness::new();
    h.start("t1");

    let result = h
        .publish_one(MeshHarness::event(
            "t1",
            "trades",
            "k1",
            RowOp::Insert,
            json!({"x": 1}),
        ))
        .await
        .unwrap();
    assert!(result.inserted);
    let hint = result.visibility_token;
    assert!(hint > 0);

    let count = h.count_at("t1", "trades", hint).await.unwrap();
    assert_eq!(count, 1, "strict read at the hint must include the event");

    h.shutdown().await;
}

#[tokio::test]
async fn hint_is_upper_bound_on_final_token() {
    let h = MeshHarness::new();
    h.start("t1");

    let mut last_hint = 0;
    for n in 0..10 {
        let result = h
            .publish_one(MeshHarness::event(
                "t1",
                "trades",
                &format!("k{n}"),
                RowOp::Insert,
                json!({"n": n}),
            ))
            .await
            .unwrap();
        assert!(result.visibility_token > last_hint, "hints advance");
        last_hint = result.visibility_token;
    }

    assert!(h.wait_visible("t1", last_hint).await);
    // The watermark reached the last hint, so every earlier hint is covered
    // and every row is visible.
    let count = h.count("t1", "trades").await.unwrap();
    assert_eq!(count, 10);

    h.shutdown().await;
}

#[tokio::test]
async fn batched_publish_becomes_visible_as_one_commit() {
    let h = MeshHarness::new();

    // Publish before the coordinator attaches so all rows land in one claim.
    let mut hints = Vec::new();
    for n in 0..5 {
        let r = h
            .publish_one(MeshHarness::event(
                "t1",
                "trades",
                &format!("k{n}"),
                RowOp::Insert,
                json!({"n": n}),
            ))
            .await
            .unwrap();
        hints.push(r.visibility_token);
    }

    h.start("t1");
    let max_hint = *hints.last().unwrap();
    assert!(h.wait_visible("t1", max_hint).await);

    // Releasing the *smallest* hint implies the whole batch committed.
    let count = h.count_at("t1", "trades", hints[0]).await.unwrap();
    assert_eq!(count, 5);

    let records = h.engine.records("t1").await.unwrap();
    assert_eq!(records.len(), 1, "one claim, one event-store record");
    assert_eq!(records[0].visibility_token, max_hint);

    h.shutdown().await;
}
