//! Maintenance plane: compaction, retention, and integrity, invoked
//! out-of-band by the ops surface.
//!
//! Every entrypoint takes the tenant lock in shared mode, so the commit
//! coordinator keeps making progress alongside routine maintenance; rare
//! exclusive actions go through [`MaintenancePlane::exclusive_window`] and
//! park the coordinator. Work happens under a pinned snapshot, and storage
//! rewriting is copy-on-write: a pinned snapshot never loses rows it could
//! already see, and the watermark is never touched.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;

use mesh_bus::TenantLocks;
use mesh_engine::{Snapshot, TableEngine};
use mesh_schemas::VisibilityToken;
use mesh_watermark::WatermarkRegistry;

mod ledger;

pub use ledger::{ChecksumLedger, LedgerEntry};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An integrity run found recorded and observed state disagreeing.
#[derive(Debug)]
pub enum IntegrityError {
    ChecksumMismatch {
        tenant_id: String,
        table_id: String,
        recorded: String,
        observed: String,
    },
    Other(anyhow::Error),
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityError::ChecksumMismatch {
                tenant_id,
                table_id,
                recorded,
                observed,
            } => write!(
                f,
                "integrity failed: tenant {tenant_id} table {table_id} recorded {recorded} observed {observed}"
            ),
            IntegrityError::Other(e) => write!(f, "integrity run failed: {e}"),
        }
    }
}

impl std::error::Error for IntegrityError {}

/// Outcome of a clean integrity run.
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub tenant_id: String,
    pub snapshot_token: VisibilityToken,
    pub table_checksums: BTreeMap<String, String>,
    /// True when this run appended a new ledger entry (the snapshot token
    /// moved since the last recording).
    pub recorded: bool,
}

// ---------------------------------------------------------------------------
// MaintenancePlane
// ---------------------------------------------------------------------------

pub struct MaintenancePlane {
    engine: Arc<dyn TableEngine>,
    watermarks: Arc<WatermarkRegistry>,
    locks: Arc<TenantLocks>,
}

impl MaintenancePlane {
    pub fn new(
        engine: Arc<dyn TableEngine>,
        watermarks: Arc<WatermarkRegistry>,
        locks: Arc<TenantLocks>,
    ) -> Self {
        Self {
            engine,
            watermarks,
            locks,
        }
    }

    /// Prune row versions nothing can observe anymore. Holds a pinned
    /// snapshot at the watermark for the duration so concurrent readers and
    /// this pass agree on the floor.
    pub async fn compact(&self, tenant_id: &str) -> Result<u64> {
        let _shared = self.locks.shared(tenant_id).await;
        let floor = self.watermarks.current(tenant_id);
        let _pin = self
            .engine
            .snapshot(tenant_id, floor)
            .await
            .context("compaction snapshot pin failed")?;
        let pruned = self
            .engine
            .compact(tenant_id, floor)
            .await
            .context("compaction failed")?;
        if pruned > 0 {
            info!(tenant_id, pruned, "compaction reclaimed versions");
        }
        Ok(pruned)
    }

    /// Retire rows whose event time predates the horizon. The removal lands
    /// as deletion markers at the current watermark, so pinned snapshots are
    /// unaffected and the watermark does not move.
    pub async fn retain(&self, tenant_id: &str, horizon_unix_ms: i64) -> Result<u64> {
        let _shared = self.locks.shared(tenant_id).await;
        let retired = self
            .engine
            .retain(tenant_id, horizon_unix_ms)
            .await
            .context("retention failed")?;
        if retired > 0 {
            info!(tenant_id, retired, horizon_unix_ms, "retention retired rows");
        }
        Ok(retired)
    }

    /// Compute per-table checksums under a pinned snapshot and compare them
    /// against the recorded ledger. A mismatch at the same snapshot token is
    /// `IntegrityError::ChecksumMismatch`; a moved token records fresh.
    pub async fn integrity(
        &self,
        tenant_id: &str,
        ledger: &mut ChecksumLedger,
    ) -> Result<IntegrityReport, IntegrityError> {
        let _shared = self.locks.shared(tenant_id).await;
        let token = self.watermarks.current(tenant_id);
        let snapshot = self
            .engine
            .snapshot(tenant_id, token)
            .await
            .map_err(|e| IntegrityError::Other(e.into()))?;

        let checksums = self
            .table_checksums(&snapshot)
            .await
            .map_err(IntegrityError::Other)?;

        let recorded = ChecksumLedger::latest_for(ledger.path(), tenant_id)
            .map_err(IntegrityError::Other)?;

        if let Some(prev) = &recorded {
            if prev.snapshot_token == token {
                for (table, observed) in &checksums {
                    if let Some(expected) = prev.table_checksums.get(table) {
                        if expected != observed {
                            return Err(IntegrityError::ChecksumMismatch {
                                tenant_id: tenant_id.to_string(),
                                table_id: table.clone(),
                                recorded: expected.clone(),
                                observed: observed.clone(),
                            });
                        }
                    }
                }
                return Ok(IntegrityReport {
                    tenant_id: tenant_id.to_string(),
                    snapshot_token: token,
                    table_checksums: checksums,
                    recorded: false,
                });
            }
        }

        ledger
            .append(tenant_id, token, checksums.clone())
            .map_err(IntegrityError::Other)?;
        Ok(IntegrityReport {
            tenant_id: tenant_id.to_string(),
            snapshot_token: token,
            table_checksums: checksums,
            recorded: true,
        })
    }

    /// Exclusive maintenance window (schema-migration style work). Blocks
    /// the coordinator until the guard drops.
    pub async fn exclusive_window(&self, tenant_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.locks.exclusive(tenant_id).await
    }

    async fn table_checksums(
        &self,
        snapshot: &Snapshot,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let tables = self
            .engine
            .tables(snapshot)
            .await
            .context("table listing failed")?;
        for table in tables {
            let result = self
                .engine
                .execute(snapshot, &format!("select * from {table}"))
                .await
                .with_context(|| format!("integrity read of {table} failed"))?;
            let mut hasher = Sha256::new();
            let columns =
                serde_json::to_vec(&result.columns).context("serialize columns for checksum")?;
            hasher.update(&columns);
            for row in &result.rows {
                let row_bytes = serde_json::to_vec(row).context("serialize row for checksum")?;
                hasher.update(&row_bytes);
            }
            out.insert(table, hex::encode(hasher.finalize()));
        }
        Ok(out)
    }
}
