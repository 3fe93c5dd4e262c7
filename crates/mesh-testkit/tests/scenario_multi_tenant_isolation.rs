//! Scenario: Multi-Tenant Isolation
//!
//! # Invariant under test
//! Tokens and watermarks are per-tenant with no cross-tenant ordering;
//! one backlogged tenant cannot starve another; and a tenant's rows are
//! structurally invisible to another tenant's queries.

use serde_json::json;

use mesh_schemas::RowOp;
use mesh_testkit::MeshHarness;

#[tokio::test]
async fn tenants_progress_independently() {
    let h = MeshHarness::new();
    h.start("t1");
    h.start("t2");

    // t1 gets a heavy backlog, t2 a single event.
    let mut t1_last = 0;
    for n in 0..20 {
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
        t1_last = r.visibility_token;
    }
    let t2 = h
        .publish_one(MeshHarness::event(
            "t2",
            "orders",
            "o1",
            RowOp::Insert,
            json!({"q": 1}),
        ))
        .await
        .unwrap();

    assert!(h.wait_visible("t2", t2.visibility_token).await, "t2 not starved");
    assert!(h.wait_visible("t1", t1_last).await);

    assert_eq!(h.count("t1", "trades").await.unwrap(), 20);
    assert_eq!(h.count("t2", "orders").await.unwrap(), 1);

    // Structural isolation: t2 sees nothing in t1's table namespace.
    assert_eq!(h.count("t2", "trades").await.unwrap(), 0);

    h.shutdown().await;
}

#[tokio::test]
async fn watermarks_are_partitioned_by_tenant() {
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

    assert!(h.watermarks.current("t1") >= r.visibility_token);
    assert_eq!(h.watermarks.current("t2"), 0, "t2 is untouched");

    h.shutdown().await;
}

#[tokio::test]
async fn degraded_tenant_does_not_block_others() {
    let h = MeshHarness::new();
    h.readiness().set_degraded("t-broken");
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

    assert!(h.readiness().is_degraded("t-broken"));
    assert!(!h.readiness().is_degraded("t1"));

    h.shutdown().await;
}
