//! Scenario: Maintenance Under Pinned Snapshots
//!
//! # Invariant under test
//! Compaction never reclaims a version a pinned snapshot can still observe;
//! retention hides rows only from snapshots opened afterwards; neither
//! touches the watermark; and an integrity run records and then verifies
//! per-table checksums against the ledger.

use serde_json::json;

use mesh_engine::TableEngine;
use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

async fn upsert_version(h: &MeshHarness, value: i64, event_time: i64) -> i64 {
    let mut env = MeshHarness::event("t1", "trades", "k1", RowOp::Upsert, json!({"v": value}));
    env.event_time_unix_ms = event_time;
    let r = h.publish_one(env).await.unwrap();
    assert!(h.wait_visible("t1", r.visibility_token).await);
    r.visibility_token
}

#[tokio::test]
async fn compaction_respects_pinned_snapshots() {
    let h = MeshHarness::new();
    h.start("t1");

    let t_old = upsert_version(&h, 1, 1_000).await;
    let pinned = h.engine.snapshot("t1", t_old).await.unwrap();

    let _t2 = upsert_version(&h, 2, 2_000).await;
    let t_new = upsert_version(&h, 3, 3_000).await;

    let maintenance = h.maintenance();
    // The oldest live pin is the floor: nothing at or above it can go.
    let pruned = maintenance.compact("t1").await.unwrap();
    assert_eq!(pruned, 0, "a pin at the oldest version blocks reclamation");

    let out = h
        .engine
        .execute(&pinned, "select * from trades")
        .await
        .unwrap();
    let v_col = out.columns.iter().position(|c| c == "v").unwrap();
    assert_eq!(out.rows[0][v_col], json!(1), "pinned snapshot keeps its view");

    // Once the pin drops, everything shadowed below the watermark goes.
    drop(pinned);
    let pruned = maintenance.compact("t1").await.unwrap();
    assert_eq!(pruned, 2);

    let snap_new = h.engine.snapshot("t1", t_new).await.unwrap();
    let out = h
        .engine
        .execute(&snap_new, "select * from trades")
        .await
        .unwrap();
    assert_eq!(out.rows[0][v_col], json!(3));

    h.shutdown().await;
}

#[tokio::test]
async fn retention_hides_rows_without_moving_the_watermark() {
    let h = MeshHarness::new();
    h.start("t1");

    let token = upsert_version(&h, 1, 1_000).await;
    let before = h.engine.snapshot("t1", token).await.unwrap();
    let watermark_before = h.watermarks.current("t1");

    let maintenance = h.maintenance();
    let retired = maintenance.retain("t1", 5_000).await.unwrap();
    assert_eq!(retired, 1);

    assert_eq!(
        h.watermarks.current("t1"),
        watermark_before,
        "retention must not move the watermark"
    );

    // The pre-retention snapshot still sees the row...
    let out = h
        .engine
        .execute(&before, "select count(*) from trades")
        .await
        .unwrap();
    assert_eq!(out.rows[0][0], json!(1));

    // ...while a fresh snapshot does not.
    assert_eq!(h.count("t1", "trades").await.unwrap(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn integrity_records_then_verifies_clean() {
    let h = MeshHarness::new();
    h.start("t1");
    upsert_version(&h, 7, 1_000).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let mut ledger = mesh_maintenance::ChecksumLedger::open(&path, true).unwrap();

    let maintenance = h.maintenance();
    let first = maintenance.integrity("t1", &mut ledger).await.unwrap();
    assert!(first.recorded, "first run records a baseline");
    assert_eq!(first.table_checksums.len(), 1);

    let second = maintenance.integrity("t1", &mut ledger).await.unwrap();
    assert!(!second.recorded, "unchanged data verifies clean");
    assert_eq!(second.table_checksums, first.table_checksums);

    assert_eq!(
        mesh_maintenance::ChecksumLedger::verify_chain(&path).unwrap(),
        1
    );

    h.shutdown().await;
}

#[tokio::test]
async fn exclusive_window_parks_the_coordinator() {
    let h = MeshHarness::new();
    let maintenance = h.maintenance();

    // Take the exclusive window BEFORE the coordinator attaches, then prove
    // ingest makes no progress until it is released.
    let window = maintenance.exclusive_window("t1").await;
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

    let stalled = h
        .watermarks
        .wait("t1", r.visibility_token, std::time::Duration::from_millis(150))
        .await;
    assert!(stalled.timed_out, "exclusive window must park the coordinator");

    drop(window);
    assert!(h.wait_visible("t1", r.visibility_token).await);

    h.shutdown().await;
}
