//! `mesh` ops commands: lag, reaper pass, integrity, config hash, ledger
//! verification.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use mesh_bus::relational;
use mesh_bus::{BusError, IngestBus, RelationalBus, TenantLocks};
use mesh_config::CoreConfig;
use mesh_engine::{MemoryEngine, TableEngine};
use mesh_maintenance::{ChecksumLedger, MaintenancePlane};
use mesh_watermark::WatermarkRegistry;

fn bus_from_pool(pool: sqlx::PgPool) -> RelationalBus {
    let cfg = CoreConfig::default().with_env_overrides();
    RelationalBus::new(pool, cfg.max_attempts, cfg.max_batch_bytes)
}

pub fn config_hash(paths: &[String]) -> Result<()> {
    let refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = mesh_config::load_layered_yaml(&refs)?;
    println!("config_hash={}", loaded.config_hash);
    println!("{}", loaded.canonical_json);
    Ok(())
}

pub async fn lag(tenant: &str) -> Result<()> {
    let pool = relational::connect_from_env().await?;
    let bus = bus_from_pool(pool);
    let depth = bus
        .depth(tenant)
        .await
        .with_context(|| format!("lag probe for tenant {tenant} failed"))?;
    // The published watermark lives with the engine; this is the queue side.
    println!(
        "tenant={} max_accepted_token={} pending_rows={} oldest_accepted_age_ms={}",
        tenant, depth.max_accepted_token, depth.pending_rows, depth.oldest_accepted_age_ms
    );
    Ok(())
}

pub async fn requeue_expired() -> Result<()> {
    let pool = relational::connect_from_env().await?;
    let bus = bus_from_pool(pool);
    let n = bus
        .requeue_expired()
        .await
        .context("requeue-expired pass failed")?;
    println!("requeued={n}");
    Ok(())
}

/// Integrity run for one tenant: pin a snapshot at the watermark, compute
/// per-table checksums, and verify them against the recorded ledger.
///
/// The tenant pg advisory lock is held for the run so a second replica's
/// maintenance pass parks; it is session-scoped, so an error path releases
/// it when the connection closes at process exit.
pub async fn integrity(tenant: &str, ledger_path: &str) -> Result<()> {
    let pool = relational::connect_from_env().await?;
    let bus = bus_from_pool(pool);

    if !bus.try_tenant_lock(tenant).await? {
        return Err(BusError::Unavailable(anyhow!(
            "tenant {tenant} advisory lock is held; another maintenance pass is running"
        ))
        .into());
    }

    // Process-local engine attach; a persistent columnar engine adapter
    // slots in behind the same seam.
    let engine: Arc<dyn TableEngine> = Arc::new(MemoryEngine::new());
    let watermarks = Arc::new(WatermarkRegistry::new());
    watermarks.rehydrate(tenant, engine.max_committed_token(tenant).await?);

    let plane = MaintenancePlane::new(
        Arc::clone(&engine),
        Arc::clone(&watermarks),
        Arc::new(TenantLocks::new()),
    );
    let mut ledger = ChecksumLedger::open(ledger_path, true)
        .with_context(|| format!("open ledger {ledger_path}"))?;

    let report = plane.integrity(tenant, &mut ledger).await?;
    let _ = bus.release_tenant_lock(tenant).await;

    println!(
        "integrity_ok=true tenant={} snapshot_token={} tables={} recorded={}",
        report.tenant_id,
        report.snapshot_token,
        report.table_checksums.len(),
        report.recorded
    );
    Ok(())
}

pub fn ledger_verify(path: &str) -> Result<()> {
    let entries = ChecksumLedger::verify_chain(path)
        .with_context(|| format!("ledger verification failed for {path}"))?;
    println!("ledger_ok=true entries={entries}");
    Ok(())
}
