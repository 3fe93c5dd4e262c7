//! Shared runtime state for mesh-daemon.
//!
//! All types here are `Clone`-able (via `Arc` or copy). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use mesh_bus::{IngestBus, MemoryBus};
use mesh_config::CoreConfig;
use mesh_coordinator::{CoordinatorPool, PipelineMetrics, TenantReadiness};
use mesh_engine::{MemoryEngine, TableEngine};
use mesh_query::QueryGate;
use mesh_schemas::VisibilityToken;
use mesh_watermark::WatermarkRegistry;

// ---------------------------------------------------------------------------
// BusMsg — SSE event payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    Watermark {
        tenant_id: String,
        token: VisibilityToken,
    },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// HTTP counters
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct HttpMetrics {
    pub ingest_requests: AtomicU64,
    pub events_accepted: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub query_requests: AtomicU64,
    pub barrier_timeouts: AtomicU64,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    /// Broadcast bus for SSE.
    pub events: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub bus: Arc<dyn IngestBus>,
    pub watermarks: Arc<WatermarkRegistry>,
    pub pool: CoordinatorPool,
    pub gate: QueryGate,
    pub pipeline_metrics: Arc<PipelineMetrics>,
    pub readiness: Arc<TenantReadiness>,
    pub http_metrics: HttpMetrics,
}

impl AppState {
    /// Wire the full in-memory stack. The relational bus backend swaps in
    /// behind the same `Arc<dyn IngestBus>` when MESH_DATABASE_URL is set
    /// (see `main.rs`).
    pub fn new_in_memory(cfg: CoreConfig) -> Arc<Self> {
        let bus: Arc<dyn IngestBus> =
            Arc::new(MemoryBus::new(cfg.max_attempts, cfg.max_batch_bytes));
        Self::with_backends(cfg, bus, Arc::new(MemoryEngine::new()))
    }

    pub fn with_backends(
        cfg: CoreConfig,
        bus: Arc<dyn IngestBus>,
        engine: Arc<dyn TableEngine>,
    ) -> Arc<Self> {
        let (events, _rx) = broadcast::channel::<BusMsg>(1024);
        let watermarks = Arc::new(WatermarkRegistry::new());

        let pool = CoordinatorPool::new(
            Arc::clone(&bus),
            Arc::clone(&engine),
            Arc::clone(&watermarks),
            cfg.clone(),
            "mesh-core-0",
        );
        let gate = QueryGate::new(
            engine,
            Arc::clone(&watermarks),
            Duration::from_millis(cfg.barrier_default_timeout_ms),
        );

        Arc::new(Self {
            events,
            build: BuildInfo {
                service: "mesh-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            pipeline_metrics: pool.metrics(),
            readiness: pool.readiness(),
            bus,
            watermarks,
            pool,
            gate,
            http_metrics: HttpMetrics::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Background feeds
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(events: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = events.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn a background task that publishes watermark movement as SSE events.
pub fn spawn_watermark_feed(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut seen: std::collections::HashMap<String, VisibilityToken> = Default::default();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let mut watch_list = match state.bus.tenants_with_backlog().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            for tenant in seen.keys() {
                if !watch_list.contains(tenant) {
                    watch_list.push(tenant.clone());
                }
            }
            for tenant in &watch_list {
                let token = state.watermarks.current(tenant);
                let moved = seen.get(tenant).map(|t| *t != token).unwrap_or(true);
                if moved {
                    seen.insert(tenant.clone(), token);
                    let _ = state.events.send(BusMsg::Watermark {
                        tenant_id: tenant.clone(),
                        token,
                    });
                }
            }
        }
    });
}
