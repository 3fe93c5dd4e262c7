//! Commit coordinator: the singleton-per-tenant loop that turns claimed
//! batches into snapshot publications.
//!
//! Loop contract (per tenant): acquire the tenant lock, claim a batch,
//! materialize it inside one engine transaction, advance the watermark,
//! ack. Retryable failures nack and back off; poison failures burn attempts
//! until the bus quarantines the rows, at which point the coordinator
//! publishes a tombstone so strict readers holding those rows' hints are
//! released. A fatal engine error halts this tenant's coordinator only and
//! flips its readiness flag to degraded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use mesh_bus::{BusError, IngestBus, NackReason, TenantLocks};
use mesh_config::CoreConfig;
use mesh_engine::{apply_batch, CommitOutcome, EngineError, MaterializeError, TableEngine};
use mesh_schemas::{now_unix_ms, Batch};
use mesh_watermark::WatermarkRegistry;

// ---------------------------------------------------------------------------
// Metrics / readiness
// ---------------------------------------------------------------------------

/// Process-wide pipeline counters, rendered by GET /v1/metrics.
#[derive(Default)]
pub struct PipelineMetrics {
    pub batches_committed: AtomicU64,
    pub events_materialized: AtomicU64,
    pub batches_nacked: AtomicU64,
    pub tombstones_published: AtomicU64,
    pub leases_expired: AtomicU64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("batches_committed", self.batches_committed.load(Ordering::Relaxed)),
            ("events_materialized", self.events_materialized.load(Ordering::Relaxed)),
            ("batches_nacked", self.batches_nacked.load(Ordering::Relaxed)),
            ("tombstones_published", self.tombstones_published.load(Ordering::Relaxed)),
            ("leases_expired", self.leases_expired.load(Ordering::Relaxed)),
        ]
    }
}

/// Per-tenant readiness flags. A tenant goes degraded when its coordinator
/// halts on a fatal engine error; the rest of the process keeps serving.
#[derive(Default)]
pub struct TenantReadiness {
    degraded: Mutex<HashSet<String>>,
}

impl TenantReadiness {
    pub fn set_degraded(&self, tenant_id: &str) {
        if let Ok(mut set) = self.degraded.lock() {
            set.insert(tenant_id.to_string());
        }
    }

    pub fn is_degraded(&self, tenant_id: &str) -> bool {
        self.degraded
            .lock()
            .map(|s| s.contains(tenant_id))
            .unwrap_or(true)
    }

    pub fn degraded_tenants(&self) -> Vec<String> {
        self.degraded
            .lock()
            .map(|s| {
                let mut v: Vec<String> = s.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// TenantCoordinator
// ---------------------------------------------------------------------------

enum BatchOutcome {
    Committed,
    Retry,
    Halt,
}

pub struct TenantCoordinator {
    tenant_id: String,
    consumer_id: String,
    bus: Arc<dyn IngestBus>,
    engine: Arc<dyn TableEngine>,
    watermarks: Arc<WatermarkRegistry>,
    locks: Arc<TenantLocks>,
    cfg: CoreConfig,
    writers_global: Arc<Semaphore>,
    writers_tenant: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
    readiness: Arc<TenantReadiness>,
}

impl TenantCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: String,
        consumer_id: String,
        bus: Arc<dyn IngestBus>,
        engine: Arc<dyn TableEngine>,
        watermarks: Arc<WatermarkRegistry>,
        locks: Arc<TenantLocks>,
        cfg: CoreConfig,
        writers_global: Arc<Semaphore>,
        metrics: Arc<PipelineMetrics>,
        readiness: Arc<TenantReadiness>,
    ) -> Self {
        let writers_tenant = Arc::new(Semaphore::new(cfg.max_engine_writers.max(1)));
        Self {
            tenant_id,
            consumer_id,
            bus,
            engine,
            watermarks,
            locks,
            cfg,
            writers_global,
            writers_tenant,
            metrics,
            readiness,
        }
    }

    /// Run until shutdown flips or a fatal engine error halts this tenant.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // Singleton among coordinators: park with jitter until ours.
        let _singleton = loop {
            if *shutdown.borrow() {
                return;
            }
            match self.locks.try_coordinator(&self.tenant_id) {
                Some(guard) => break guard,
                None => {
                    tokio::time::sleep(Duration::from_millis(
                        self.cfg.idle_poll_ms + lock_jitter_ms(),
                    ))
                    .await;
                }
            }
        };

        // Rehydrate the watermark from the event store; anything in flight
        // that never committed was never visible and will be re-claimed.
        match self.engine.max_committed_token(&self.tenant_id).await {
            Ok(token) => {
                self.watermarks.rehydrate(&self.tenant_id, token);
                info!(tenant_id = %self.tenant_id, token, "coordinator attached");
            }
            Err(e) => {
                error!(tenant_id = %self.tenant_id, error = %e, "watermark rehydrate failed");
                self.readiness.set_degraded(&self.tenant_id);
                return;
            }
        }

        let mut publish_rx = self.bus.subscribe_publishes();
        loop {
            if *shutdown.borrow() {
                return;
            }

            // Shared phase with maintenance; exclusive actions park us here.
            let phase = self.locks.shared(&self.tenant_id).await;

            let batch = match self
                .bus
                .claim_batch_for(
                    &self.tenant_id,
                    &self.consumer_id,
                    self.cfg.max_batch_rows,
                    self.cfg.lease_seconds,
                )
                .await
            {
                Ok(b) => b,
                Err(e) => {
                    warn!(tenant_id = %self.tenant_id, error = %e, "claim failed; backing off");
                    drop(phase);
                    tokio::time::sleep(Duration::from_millis(self.cfg.idle_poll_ms)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                self.resolve_failed().await;
                drop(phase);
                let idle = Duration::from_millis(self.cfg.idle_poll_ms);
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = publish_rx.changed() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
                continue;
            }

            match self.process_batch(&batch).await {
                BatchOutcome::Committed => {}
                BatchOutcome::Retry => {
                    drop(phase);
                    let backoff = self
                        .cfg
                        .idle_poll_ms
                        .saturating_mul(batch.attempt.max(1) as u64)
                        .min(2_000);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
                BatchOutcome::Halt => {
                    self.readiness.set_degraded(&self.tenant_id);
                    error!(tenant_id = %self.tenant_id, "coordinator halted on fatal engine error");
                    return;
                }
            }

            // Poison rows quarantined by this iteration need their tokens
            // covered before anyone claims again.
            self.resolve_failed().await;
        }
    }

    async fn process_batch(&self, batch: &Batch) -> BatchOutcome {
        let _global = match self.writers_global.acquire().await {
            Ok(g) => g,
            Err(_) => return BatchOutcome::Halt, // semaphore closed: shutdown
        };
        let _tenant = match self.writers_tenant.acquire().await {
            Ok(g) => g,
            Err(_) => return BatchOutcome::Halt,
        };

        let mut lease = LeaseTracker::new(batch, self.cfg.lease_seconds);

        let mut txn = match self.engine.begin(&self.tenant_id).await {
            Ok(t) => t,
            Err(EngineError::Busy(m)) => {
                warn!(tenant_id = %self.tenant_id, busy = %m, "engine busy on begin");
                return self.nack_batch(batch, NackReason::Retryable).await;
            }
            Err(EngineError::SchemaMismatch(m)) => {
                warn!(tenant_id = %self.tenant_id, error = %m, "poison on begin");
                return self.nack_batch(batch, NackReason::Poison).await;
            }
            Err(EngineError::Fatal(e)) => {
                error!(tenant_id = %self.tenant_id, error = %e, "fatal on begin");
                return BatchOutcome::Halt;
            }
        };

        if let Err(e) = apply_batch(txn.as_mut(), &batch.envelopes) {
            return match e {
                MaterializeError::SchemaMismatch(m) => {
                    warn!(tenant_id = %self.tenant_id, batch_id = %batch.batch_id, error = %m, "poison batch");
                    self.nack_batch(batch, NackReason::Poison).await
                }
                MaterializeError::Busy(m) => {
                    warn!(tenant_id = %self.tenant_id, busy = %m, "retryable apply failure");
                    self.nack_batch(batch, NackReason::Retryable).await
                }
                MaterializeError::Fatal(e) => {
                    error!(tenant_id = %self.tenant_id, error = %e, "fatal apply failure");
                    BatchOutcome::Halt
                }
            };
        }

        // Heartbeat once before the commit; a lease we cannot extend means
        // another consumer may own these rows, so abort without publishing.
        if !self.heartbeat_if_due(batch, &mut lease).await {
            self.metrics.leases_expired.fetch_add(1, Ordering::Relaxed);
            warn!(tenant_id = %self.tenant_id, batch_id = %batch.batch_id, "lease lost mid-apply; aborting");
            return BatchOutcome::Retry;
        }
        if lease.expired() {
            self.metrics.leases_expired.fetch_add(1, Ordering::Relaxed);
            warn!(tenant_id = %self.tenant_id, batch_id = %batch.batch_id, "lease expired before commit; aborting");
            return BatchOutcome::Retry;
        }

        let outcome = match txn
            .commit(
                batch.batch_id,
                batch.token_ceiling,
                batch.event_ids(),
                false,
            )
            .await
        {
            Ok(o) => o,
            Err(EngineError::Busy(m)) => {
                warn!(tenant_id = %self.tenant_id, busy = %m, "engine busy on commit");
                return self.nack_batch(batch, NackReason::Retryable).await;
            }
            Err(EngineError::SchemaMismatch(m)) => {
                warn!(tenant_id = %self.tenant_id, error = %m, "poison on commit");
                return self.nack_batch(batch, NackReason::Poison).await;
            }
            Err(EngineError::Fatal(e)) => {
                error!(tenant_id = %self.tenant_id, error = %e, "fatal on commit");
                return BatchOutcome::Halt;
            }
        };

        let token = outcome.token();
        if matches!(outcome, CommitOutcome::AlreadyCommitted(_)) {
            info!(tenant_id = %self.tenant_id, batch_id = %batch.batch_id, token,
                  "batch already durable; short-circuiting to ack");
        } else {
            self.metrics.batches_committed.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .events_materialized
                .fetch_add(batch.envelopes.len() as u64, Ordering::Relaxed);
        }

        self.watermarks.publish(&self.tenant_id, token);

        match self.bus.ack(batch.batch_id, &batch.event_ids()).await {
            Ok(()) => BatchOutcome::Committed,
            Err(BusError::LeaseExpired) => {
                // Commit is durable; the requeued rows will short-circuit on
                // re-claim via the event store's batch/token dedup.
                self.metrics.leases_expired.fetch_add(1, Ordering::Relaxed);
                warn!(tenant_id = %self.tenant_id, batch_id = %batch.batch_id,
                      "ack lost lease after durable commit; re-claim will short-circuit");
                BatchOutcome::Committed
            }
            Err(e) => {
                warn!(tenant_id = %self.tenant_id, error = %e, "ack failed");
                BatchOutcome::Retry
            }
        }
    }

    async fn nack_batch(&self, batch: &Batch, reason: NackReason) -> BatchOutcome {
        self.metrics.batches_nacked.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self
            .bus
            .nack(batch.batch_id, &batch.event_ids(), reason)
            .await
        {
            warn!(tenant_id = %self.tenant_id, error = %e, "nack failed; lease reaper will requeue");
        }
        BatchOutcome::Retry
    }

    /// Extend the lease once a third of it has elapsed. Returns false when
    /// the lease is already gone.
    async fn heartbeat_if_due(&self, batch: &Batch, lease: &mut LeaseTracker) -> bool {
        if !lease.due() {
            return true;
        }
        match self
            .bus
            .extend_lease(batch.batch_id, self.cfg.lease_seconds)
            .await
        {
            Ok(()) => {
                lease.extended(self.cfg.lease_seconds);
                true
            }
            Err(BusError::LeaseExpired) => false,
            Err(e) => {
                warn!(tenant_id = %self.tenant_id, error = %e, "heartbeat failed transiently");
                !lease.expired()
            }
        }
    }

    /// Publish tombstones for quarantined rows so their reservations stop
    /// blocking strict readers, then mark them resolved at the bus.
    async fn resolve_failed(&self) {
        let groups = match self.bus.failed_unresolved(&self.tenant_id).await {
            Ok(g) => g,
            Err(e) => {
                warn!(tenant_id = %self.tenant_id, error = %e, "failed-row scan failed");
                return;
            }
        };
        for group in groups {
            if group.token_ceiling == 0 {
                // No reservation to cover; nothing can be waiting on it.
                if let Err(e) = self
                    .bus
                    .mark_failed_resolved(&self.tenant_id, &group.event_ids)
                    .await
                {
                    warn!(tenant_id = %self.tenant_id, error = %e, "failed-row resolve failed");
                }
                continue;
            }

            let txn = match self.engine.begin(&self.tenant_id).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(tenant_id = %self.tenant_id, error = %e, "tombstone begin failed");
                    return;
                }
            };
            match txn
                .commit(
                    group.batch_id,
                    group.token_ceiling,
                    group.event_ids.clone(),
                    true,
                )
                .await
            {
                Ok(outcome) => {
                    self.watermarks.publish(&self.tenant_id, outcome.token());
                    self.metrics
                        .tombstones_published
                        .fetch_add(1, Ordering::Relaxed);
                    info!(tenant_id = %self.tenant_id, batch_id = %group.batch_id,
                          token = group.token_ceiling, "tombstone published for poison batch");
                    if let Err(e) = self
                        .bus
                        .mark_failed_resolved(&self.tenant_id, &group.event_ids)
                        .await
                    {
                        warn!(tenant_id = %self.tenant_id, error = %e, "failed-row resolve failed");
                    }
                }
                Err(e) => {
                    warn!(tenant_id = %self.tenant_id, error = %e, "tombstone commit failed");
                }
            }
        }
    }
}

/// Local view of the batch lease for the heartbeat cadence.
struct LeaseTracker {
    lease_until_unix_ms: i64,
    heartbeat_due_unix_ms: i64,
    lease_ms: i64,
}

impl LeaseTracker {
    fn new(batch: &Batch, lease_seconds: u64) -> Self {
        let lease_ms = (lease_seconds as i64) * 1000;
        Self {
            lease_until_unix_ms: batch.lease_until_unix_ms,
            heartbeat_due_unix_ms: batch.claimed_unix_ms + lease_ms / 3,
            lease_ms,
        }
    }

    fn due(&self) -> bool {
        now_unix_ms() >= self.heartbeat_due_unix_ms
    }

    fn expired(&self) -> bool {
        now_unix_ms() > self.lease_until_unix_ms
    }

    fn extended(&mut self, lease_seconds: u64) {
        let now = now_unix_ms();
        self.lease_until_unix_ms = now + (lease_seconds as i64) * 1000;
        self.heartbeat_due_unix_ms = now + self.lease_ms / 3;
    }
}

fn lock_jitter_ms() -> u64 {
    // Millisecond-of-second as cheap jitter; no RNG dependency needed.
    (Utc::now().timestamp_subsec_millis() % 97) as u64
}

// ---------------------------------------------------------------------------
// CoordinatorPool
// ---------------------------------------------------------------------------

/// Hosts one coordinator task per attached tenant plus the lease reaper.
pub struct CoordinatorPool {
    bus: Arc<dyn IngestBus>,
    engine: Arc<dyn TableEngine>,
    watermarks: Arc<WatermarkRegistry>,
    locks: Arc<TenantLocks>,
    cfg: CoreConfig,
    writers_global: Arc<Semaphore>,
    metrics: Arc<PipelineMetrics>,
    readiness: Arc<TenantReadiness>,
    consumer_id: String,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl CoordinatorPool {
    pub fn new(
        bus: Arc<dyn IngestBus>,
        engine: Arc<dyn TableEngine>,
        watermarks: Arc<WatermarkRegistry>,
        cfg: CoreConfig,
        consumer_id: &str,
    ) -> Self {
        let (shutdown_tx, _rx) = watch::channel(false);
        Self {
            bus,
            engine,
            watermarks,
            locks: Arc::new(TenantLocks::new()),
            writers_global: Arc::new(Semaphore::new(cfg.max_engine_writers_global.max(1))),
            cfg,
            metrics: Arc::new(PipelineMetrics::default()),
            readiness: Arc::new(TenantReadiness::default()),
            consumer_id: consumer_id.to_string(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn readiness(&self) -> Arc<TenantReadiness> {
        Arc::clone(&self.readiness)
    }

    pub fn locks(&self) -> Arc<TenantLocks> {
        Arc::clone(&self.locks)
    }

    /// Spawn the tenant's coordinator task if not already attached.
    pub fn attach(&self, tenant_id: &str) {
        let mut tasks = match self.tasks.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if tasks.iter().any(|(t, h)| t == tenant_id && !h.is_finished()) {
            return;
        }

        let coordinator = TenantCoordinator::new(
            tenant_id.to_string(),
            self.consumer_id.clone(),
            Arc::clone(&self.bus),
            Arc::clone(&self.engine),
            Arc::clone(&self.watermarks),
            Arc::clone(&self.locks),
            self.cfg.clone(),
            Arc::clone(&self.writers_global),
            Arc::clone(&self.metrics),
            Arc::clone(&self.readiness),
        );
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            coordinator.run(shutdown_rx).await;
        });
        tasks.push((tenant_id.to_string(), handle));
    }

    /// Attach every tenant that currently has backlog.
    pub async fn attach_backlogged(&self) -> Result<(), BusError> {
        for tenant in self.bus.tenants_with_backlog().await? {
            self.attach(&tenant);
        }
        Ok(())
    }

    /// Background lease reaper: requeues expired claims on a fixed cadence.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let bus = Arc::clone(&self.bus);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {
                        match bus.requeue_expired().await {
                            Ok(0) => {}
                            Ok(n) => info!(requeued = n, "lease reaper requeued expired claims"),
                            Err(e) => warn!(error = %e, "lease reaper pass failed"),
                        }
                    }
                }
            }
        })
    }

    /// Flip shutdown and wait for every coordinator task to park.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut tasks = match self.tasks.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for (tenant, handle) in handles {
            if let Err(e) = handle.await {
                warn!(tenant_id = %tenant, error = %e, "coordinator task join failed");
            }
        }
    }
}
