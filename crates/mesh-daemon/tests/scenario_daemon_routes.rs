//! Scenario: Daemon Routes
//!
//! # Invariant under test
//! The HTTP surface honors the core contract end to end, in-process:
//! - POST /v1/ingest publishes and returns per-event results;
//! - POST /v1/query enforces the barrier (200 on release, 504 with the
//!   observed watermark on timeout, 400 on unsupported SQL);
//! - GET /v1/lag merges queue depth with the published watermark;
//! - GET /v1/health, /v1/ready, /v1/metrics respond.
//!
//! Handlers are driven through `tower::ServiceExt::oneshot` on the bare
//! router; no socket is bound.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use mesh_config::CoreConfig;
use mesh_daemon::{routes, state::AppState};

fn test_state() -> Arc<AppState> {
    AppState::new_in_memory(CoreConfig {
        idle_poll_ms: 10,
        ..CoreConfig::default()
    })
}

async fn send_json(
    state: &Arc<AppState>,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let router = routes::build_router(Arc::clone(state));
    let request = match body {
        Some(v) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, value)
}

fn event(ik: &str, x: i64) -> Value {
    json!({
        "event_id": format!("ev-{ik}-{x}"),
        "tenant_id": "t1",
        "table_id": "trades",
        "idempotency_key": ik,
        "op": "insert",
        "payload": {"x": x},
        "event_time_unix_ms": 1_700_000_000_000i64 + x,
    })
}

#[tokio::test]
async fn health_reports_build_info() {
    let st = test_state();
    let (status, body) = send_json(&st, "GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert_eq!(body["service"], json!("mesh-daemon"));
}

#[tokio::test]
async fn ingest_then_strict_query_round_trips() {
    let st = test_state();

    let (status, body) = send_json(
        &st,
        "POST",
        "/v1/ingest",
        Some(json!({"events": [event("k1", 1)]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hint = body["results"][0]["visibility_token"].as_i64().unwrap();
    assert!(body["results"][0]["inserted"].as_bool().unwrap());
    assert!(hint > 0);

    let (status, body) = send_json(
        &st,
        "POST",
        "/v1/query",
        Some(json!({
            "tenant_id": "t1",
            "sql": "select count(*) from trades",
            "min_visibility_token": hint,
            "barrier_timeout_ms": 5_000,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rows"][0][0], json!(1));
    assert!(body["snapshot_token"].as_i64().unwrap() >= hint);

    st.pool.shutdown().await;
}

#[tokio::test]
async fn barrier_timeout_maps_to_504_with_observed_watermark() {
    let st = test_state();

    let (status, body) = send_json(
        &st,
        "POST",
        "/v1/query",
        Some(json!({
            "tenant_id": "t-quiet",
            "sql": "select count(*) from trades",
            "min_visibility_token": 7,
            "barrier_timeout_ms": 100,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["observed_watermark"], json!(0));
}

#[tokio::test]
async fn unsupported_sql_maps_to_400() {
    let st = test_state();
    let (status, _body) = send_json(
        &st,
        "POST",
        "/v1/query",
        Some(json!({
            "tenant_id": "t1",
            "sql": "drop table trades",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn lag_merges_queue_depth_and_watermark() {
    let st = test_state();

    let (status, _) = send_json(
        &st,
        "POST",
        "/v1/ingest",
        Some(json!({"events": [event("k1", 1), event("k2", 2)]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&st, "GET", "/v1/lag?tenant_id=t1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tenant_id"], json!("t1"));
    assert_eq!(body["max_accepted_token"], json!(2));
    assert!(body["pending_rows"].as_u64().unwrap() <= 2);

    st.pool.shutdown().await;
}

#[tokio::test]
async fn ready_flips_on_degraded_tenant() {
    let st = test_state();

    let (status, body) = send_json(&st, "GET", "/v1/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], json!(true));

    st.readiness.set_degraded("t-broken");
    let (status, body) = send_json(&st, "GET", "/v1/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["degraded_tenants"], json!(["t-broken"]));
}

#[tokio::test]
async fn metrics_exposes_counters_as_text() {
    let st = test_state();

    let (status, _) = send_json(
        &st,
        "POST",
        "/v1/ingest",
        Some(json!({"events": [event("k1", 1)]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&st, "GET", "/v1/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("duckmesh_http_ingest_requests 1"));
    assert!(text.contains("duckmesh_batches_committed"));

    st.pool.shutdown().await;
}

#[tokio::test]
async fn duplicate_ingest_reports_dedup() {
    let st = test_state();

    let ev = event("k1", 1);
    let (_, first) = send_json(&st, "POST", "/v1/ingest", Some(json!({"events": [ev.clone()]}))).await;
    let (_, second) = send_json(&st, "POST", "/v1/ingest", Some(json!({"events": [ev]}))).await;

    assert_eq!(first["results"][0]["inserted"], json!(true));
    assert_eq!(second["results"][0]["inserted"], json!(false));
    assert_eq!(
        second["results"][0]["event_id"],
        first["results"][0]["event_id"]
    );

    st.pool.shutdown().await;
}
