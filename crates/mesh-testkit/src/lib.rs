//! Full in-memory stack for scenario tests: MemoryBus + MemoryEngine +
//! watermark registry + coordinator pool + query gate, wired the way the
//! daemon wires them. The cross-cutting scenario suites live in this
//! crate's `tests/` directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

use mesh_bus::{IngestBus, MemoryBus};
use mesh_config::CoreConfig;
use mesh_coordinator::{CoordinatorPool, PipelineMetrics, TenantReadiness};
use mesh_engine::{MemoryEngine, TableEngine};
use mesh_maintenance::MaintenancePlane;
use mesh_query::{QueryGate, QueryOpts, QueryResponse};
use mesh_schemas::{now_unix_ms, Envelope, PublishResult, RowOp, VisibilityToken};
use mesh_watermark::WatermarkRegistry;

pub struct MeshHarness {
    pub bus: Arc<MemoryBus>,
    pub engine: MemoryEngine,
    pub watermarks: Arc<WatermarkRegistry>,
    pub pool: CoordinatorPool,
    pub gate: QueryGate,
    pub cfg: CoreConfig,
}

impl MeshHarness {
    /// Harness with test-friendly timings (tight idle poll, short barrier).
    pub fn new() -> Self {
        let cfg = CoreConfig {
            idle_poll_ms: 10,
            ..CoreConfig::default()
        };
        Self::with_config(cfg)
    }

    pub fn with_config(cfg: CoreConfig) -> Self {
        let bus = Arc::new(MemoryBus::new(cfg.max_attempts, cfg.max_batch_bytes));
        let engine = MemoryEngine::new();
        let watermarks = Arc::new(WatermarkRegistry::new());

        let bus_dyn: Arc<dyn IngestBus> = Arc::clone(&bus) as Arc<dyn IngestBus>;
        let engine_dyn: Arc<dyn TableEngine> = Arc::new(engine.clone());

        let pool = CoordinatorPool::new(
            Arc::clone(&bus_dyn),
            Arc::clone(&engine_dyn),
            Arc::clone(&watermarks),
            cfg.clone(),
            "mesh-test-0",
        );
        let gate = QueryGate::new(
            engine_dyn,
            Arc::clone(&watermarks),
            Duration::from_millis(cfg.barrier_default_timeout_ms),
        );

        Self {
            bus,
            engine,
            watermarks,
            pool,
            gate,
            cfg,
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.pool.metrics()
    }

    /// Maintenance plane wired to the same engine, registry, and locks as
    /// the coordinator pool.
    pub fn maintenance(&self) -> MaintenancePlane {
        MaintenancePlane::new(
            Arc::new(self.engine.clone()),
            Arc::clone(&self.watermarks),
            self.pool.locks(),
        )
    }

    pub fn readiness(&self) -> Arc<TenantReadiness> {
        self.pool.readiness()
    }

    /// Attach the tenant's coordinator task.
    pub fn start(&self, tenant_id: &str) {
        self.pool.attach(tenant_id);
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Build an envelope with a fresh event id.
    pub fn event(
        tenant_id: &str,
        table_id: &str,
        idempotency_key: &str,
        op: RowOp,
        payload: Value,
    ) -> Envelope {
        Envelope {
            event_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            table_id: table_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            op,
            payload,
            event_time_unix_ms: now_unix_ms(),
        }
    }

    pub async fn publish_one(&self, env: Envelope) -> Result<PublishResult> {
        let mut results = self.bus.publish(vec![env]).await?;
        Ok(results.remove(0))
    }

    /// Block until the tenant watermark reaches `token` (test-scale bound).
    pub async fn wait_visible(&self, tenant_id: &str, token: VisibilityToken) -> bool {
        !self
            .watermarks
            .wait(tenant_id, token, Duration::from_secs(5))
            .await
            .timed_out
    }

    /// Strict read-after-write count of a table.
    pub async fn count_at(
        &self,
        tenant_id: &str,
        table_id: &str,
        min_token: VisibilityToken,
    ) -> Result<i64> {
        let resp = self
            .gate
            .query(
                tenant_id,
                &format!("select count(*) from {table_id}"),
                QueryOpts {
                    min_visibility_token: Some(min_token),
                    barrier_timeout_ms: Some(5_000),
                },
            )
            .await?;
        count_from(&resp)
    }

    /// Relaxed count at the current watermark.
    pub async fn count(&self, tenant_id: &str, table_id: &str) -> Result<i64> {
        let resp = self
            .gate
            .query(
                tenant_id,
                &format!("select count(*) from {table_id}"),
                QueryOpts::default(),
            )
            .await?;
        count_from(&resp)
    }
}

impl Default for MeshHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn count_from(resp: &QueryResponse) -> Result<i64> {
    resp.rows
        .first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_i64())
        .ok_or_else(|| anyhow::anyhow!("count query returned no rows"))
}
