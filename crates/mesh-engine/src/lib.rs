//! Engine seam between the write-visibility pipeline and the embedded
//! columnar engine.
//!
//! The pipeline only ever talks to [`TableEngine`]: a write transaction that
//! stages row effects and commits them together with the event-store record
//! and the visibility-counter advance, plus snapshot-scoped reads. The
//! embedded engine's full SQL execution is an external collaborator;
//! [`MemoryEngine`] implements the narrow contract the pipeline and its
//! tests exercise.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use mesh_schemas::{EventStoreRecord, RowOp, VisibilityToken};

mod event_log;
pub mod materialize;
mod memory;

pub use event_log::{EventLog, LogAppendError};
pub use materialize::{apply_batch, MaterializeError};
pub use memory::MemoryEngine;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Engine failure classes. The coordinator maps them to nack reasons:
/// `SchemaMismatch` is poison, `Busy` retries, `Fatal` halts the tenant.
#[derive(Debug)]
pub enum EngineError {
    SchemaMismatch(String),
    Busy(String),
    Fatal(anyhow::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SchemaMismatch(m) => write!(f, "schema mismatch: {m}"),
            EngineError::Busy(m) => write!(f, "engine busy: {m}"),
            EngineError::Fatal(e) => write!(f, "engine fatal: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Opaque read handle at a fixed visibility token.
///
/// Holding a snapshot pins storage: compaction must not reclaim row versions
/// the snapshot can still observe. The pin is released on drop, on every
/// exit path including cancellation.
pub struct Snapshot {
    tenant_id: String,
    token: VisibilityToken,
    /// Storage artifact generation captured at open. Maintenance rewrites
    /// (retention, compaction artifacts) bump the tenant generation, so a
    /// snapshot opened before the rewrite keeps observing the old artifacts
    /// while one opened after sees the new ones at the same token.
    generation: u64,
    _pin: Box<dyn Send + Sync>,
}

impl Snapshot {
    pub fn new(
        tenant_id: String,
        token: VisibilityToken,
        generation: u64,
        pin: Box<dyn Send + Sync>,
    ) -> Self {
        Self {
            tenant_id,
            token,
            generation,
            _pin: pin,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn token(&self) -> VisibilityToken {
        self.token
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Result set of a snapshot read.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Outcome of a batch commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(VisibilityToken),
    /// The batch (or its token range) is already durable: the claim lost a
    /// race with an earlier incarnation that died between commit and ack.
    /// The caller short-circuits to ack.
    AlreadyCommitted(VisibilityToken),
}

impl CommitOutcome {
    pub fn token(&self) -> VisibilityToken {
        match self {
            CommitOutcome::Committed(t) | CommitOutcome::AlreadyCommitted(t) => *t,
        }
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// One open write transaction. Staged effects become visible atomically at
/// commit; dropping the transaction discards them.
#[async_trait]
pub trait EngineTxn: Send {
    /// Stage one row effect. Upsert and insert key on
    /// `(table_id, idempotency_key)`; delete marks by the same key.
    fn apply(
        &mut self,
        table_id: &str,
        op: RowOp,
        idempotency_key: &str,
        payload: &Value,
        event_time_unix_ms: i64,
    ) -> Result<(), EngineError>;

    /// Atomically advance the tenant visibility counter to `token_ceiling`,
    /// append the event-store record, and install the staged row versions.
    /// A tombstone commit installs no rows but still burns the token range.
    async fn commit(
        self: Box<Self>,
        batch_id: Uuid,
        token_ceiling: VisibilityToken,
        event_ids: Vec<String>,
        tombstone: bool,
    ) -> Result<CommitOutcome, EngineError>;
}

/// The embedded analytic engine as the pipeline sees it.
#[async_trait]
pub trait TableEngine: Send + Sync {
    async fn begin(&self, tenant_id: &str) -> Result<Box<dyn EngineTxn>, EngineError>;

    /// Pin a snapshot at `token`; reads through it observe exactly the
    /// materializations with commit token <= `token`.
    async fn snapshot(
        &self,
        tenant_id: &str,
        token: VisibilityToken,
    ) -> Result<Snapshot, EngineError>;

    async fn execute(&self, snapshot: &Snapshot, sql: &str) -> Result<QueryOutput, EngineError>;

    /// Largest committed token for the tenant; watermark rehydration.
    async fn max_committed_token(&self, tenant_id: &str) -> Result<VisibilityToken, EngineError>;

    /// Event-store records in token order (audit tooling distinguishes
    /// tombstones via the flag).
    async fn records(&self, tenant_id: &str) -> Result<Vec<EventStoreRecord>, EngineError>;

    /// Tables with at least one visible row under the snapshot.
    async fn tables(&self, snapshot: &Snapshot) -> Result<Vec<String>, EngineError>;

    /// Prune row versions that neither a pinned snapshot nor any snapshot
    /// opened at or above `visible_floor` (the caller's current watermark)
    /// can observe. Returns the number of versions reclaimed.
    async fn compact(
        &self,
        tenant_id: &str,
        visible_floor: VisibilityToken,
    ) -> Result<u64, EngineError>;

    /// Retention: write deletion markers at the current committed token for
    /// keys whose latest event time predates `horizon_unix_ms`. Pinned
    /// snapshots are unaffected; only snapshots opened afterwards observe
    /// the removal. Returns the number of keys retired.
    async fn retain(&self, tenant_id: &str, horizon_unix_ms: i64) -> Result<u64, EngineError>;
}
