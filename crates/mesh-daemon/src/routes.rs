//! Axum router and all HTTP handlers for mesh-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::atomic::Ordering, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use mesh_bus::BusError;
use mesh_query::{QueryError, QueryOpts};

use crate::{
    api_types::{
        ErrorResponse, HealthResponse, IngestRequest, IngestResponse, LagParams, QueryRequest,
        ReadyResponse,
    },
    state::{AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ingest", post(ingest))
        .route("/v1/query", post(query))
        .route("/v1/lag", get(lag))
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/metrics", get(metrics))
        .route("/v1/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /v1/ingest
// ---------------------------------------------------------------------------

pub(crate) async fn ingest(
    State(st): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Response {
    st.http_metrics.ingest_requests.fetch_add(1, Ordering::Relaxed);

    // Any tenant seen here gets a coordinator; attach is idempotent.
    let mut tenants: Vec<&str> = req.events.iter().map(|e| e.tenant_id.as_str()).collect();
    tenants.sort_unstable();
    tenants.dedup();
    for tenant in tenants {
        st.pool.attach(tenant);
    }

    match st.bus.publish(req.events).await {
        Ok(results) => {
            let inserted = results.iter().filter(|r| r.inserted).count() as u64;
            let duplicates = results.len() as u64 - inserted;
            st.http_metrics
                .events_accepted
                .fetch_add(inserted, Ordering::Relaxed);
            st.http_metrics
                .events_deduplicated
                .fetch_add(duplicates, Ordering::Relaxed);
            (StatusCode::OK, Json(IngestResponse { results })).into_response()
        }
        Err(e @ BusError::Unavailable(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                observed_watermark: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                observed_watermark: None,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/query
// ---------------------------------------------------------------------------

pub(crate) async fn query(
    State(st): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Response {
    st.http_metrics.query_requests.fetch_add(1, Ordering::Relaxed);

    let opts = QueryOpts {
        min_visibility_token: req.min_visibility_token,
        barrier_timeout_ms: req.barrier_timeout_ms,
    };
    match st.gate.query(&req.tenant_id, &req.sql, opts).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(QueryError::BarrierTimeout {
            min_visibility_token,
            observed,
        }) => {
            st.http_metrics
                .barrier_timeouts
                .fetch_add(1, Ordering::Relaxed);
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(ErrorResponse {
                    error: format!(
                        "barrier timeout waiting for visibility token {min_visibility_token}"
                    ),
                    observed_watermark: Some(observed),
                }),
            )
                .into_response()
        }
        Err(QueryError::Rejected(m)) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: m,
                observed_watermark: None,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
                observed_watermark: None,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/lag
// ---------------------------------------------------------------------------

pub(crate) async fn lag(
    State(st): State<Arc<AppState>>,
    Query(params): Query<LagParams>,
) -> Response {
    match st.bus.depth(&params.tenant_id).await {
        Ok(depth) => {
            let published = st.watermarks.current(&params.tenant_id);
            (
                StatusCode::OK,
                Json(depth.into_lag(&params.tenant_id, published)),
            )
                .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: e.to_string(),
                observed_watermark: None,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/health — liveness + build info
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/ready — degraded tenants flip readiness
// ---------------------------------------------------------------------------

pub(crate) async fn ready(State(st): State<Arc<AppState>>) -> Response {
    let degraded = st.readiness.degraded_tenants();
    if degraded.is_empty() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                degraded_tenants: degraded,
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                degraded_tenants: degraded,
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// GET /v1/metrics — plain-text counter exposition
// ---------------------------------------------------------------------------

pub(crate) async fn metrics(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let mut out = String::new();
    for (name, value) in st.pipeline_metrics.snapshot() {
        out.push_str(&format!("duckmesh_{name} {value}\n"));
    }
    let http = &st.http_metrics;
    for (name, value) in [
        ("ingest_requests", http.ingest_requests.load(Ordering::Relaxed)),
        ("events_accepted", http.events_accepted.load(Ordering::Relaxed)),
        (
            "events_deduplicated",
            http.events_deduplicated.load(Ordering::Relaxed),
        ),
        ("query_requests", http.query_requests.load(Ordering::Relaxed)),
        ("barrier_timeouts", http.barrier_timeouts.load(Ordering::Relaxed)),
    ] {
        out.push_str(&format!("duckmesh_http_{name} {value}\n"));
    }
    out.push_str(&format!("duckmesh_uptime_seconds {}\n", crate::state::uptime_secs()));
    (StatusCode::OK, out)
}

// ---------------------------------------------------------------------------
// GET /v1/stream — SSE of heartbeats and watermark movement
// ---------------------------------------------------------------------------

pub(crate) async fn stream(
    State(st): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = st.events.subscribe();
    info!("sse client attached");

    let stream = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(msg) => {
                let name = match &msg {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Watermark { .. } => "watermark",
                };
                match Event::default().event(name).json_data(&msg) {
                    Ok(ev) => Some(Ok(ev)),
                    Err(_) => None,
                }
            }
            // Lagged receivers skip missed messages rather than erroring.
            Err(_) => None,
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
