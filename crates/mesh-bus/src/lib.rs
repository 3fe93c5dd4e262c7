//! Durable ingest bus: at-least-once queue of event envelopes with
//! lease-based claim semantics.
//!
//! The bus is a pluggable capability set behind `Arc<dyn IngestBus>`:
//! `publish / claim_batch / ack / nack / extend_lease / requeue_expired`.
//! Two backends ship here:
//!
//! - [`MemoryBus`] — in-process queue. Lease tokens model broker delivery
//!   tags and dedup runs against an in-process idempotency index, so the
//!   backend doubles as the contract shape a log-broker implementation must
//!   satisfy. Every non-DB test runs on it.
//! - [`RelationalBus`] — PostgreSQL. Single durable table, claims via
//!   `FOR UPDATE SKIP LOCKED`, dedup via unique constraint.
//!
//! Parity: the same scenario suite runs against both backends
//! (`tests/scenario_bus_contract.rs`, relational run gated on
//! `MESH_DATABASE_URL`).

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use mesh_schemas::{Batch, Envelope, LagSnapshot, PublishResult, VisibilityToken};

mod locks;
mod memory;
pub mod relational;

pub use locks::TenantLocks;
pub use memory::MemoryBus;
pub use relational::RelationalBus;

pub const ENV_DB_URL: &str = "MESH_DATABASE_URL";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a bus call failed. Callers branch on the kind: `Unavailable` is
/// transient (retry), `LeaseExpired` means the caller lost ownership.
#[derive(Debug)]
pub enum BusError {
    /// The durable store is unreachable or refused the operation.
    Unavailable(anyhow::Error),
    /// The batch lease lapsed (or the rows were re-claimed) before the call.
    LeaseExpired,
    /// Invariant breakage inside the bus itself.
    Internal(anyhow::Error),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Unavailable(e) => write!(f, "bus unavailable: {e}"),
            BusError::LeaseExpired => write!(f, "lease expired"),
            BusError::Internal(e) => write!(f, "bus internal error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

/// Failure class reported with a nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// Transient apply failure (engine busy, I/O); the batch should retry.
    Retryable,
    /// The batch can never materialize (schema mismatch, payload parse).
    Poison,
}

impl NackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NackReason::Retryable => "retryable",
            NackReason::Poison => "poison",
        }
    }
}

/// A group of FAILED rows whose token reservations still need a tombstone.
///
/// Rows enter this set when a nack (or the lease reaper) quarantines them at
/// the attempt cap. The coordinator publishes a tombstone record at
/// `token_ceiling` and then calls `mark_failed_resolved`; until it does, the
/// group keeps reappearing so a crash between the two steps cannot strand
/// strict readers.
#[derive(Debug, Clone)]
pub struct FailedGroup {
    pub tenant_id: String,
    pub batch_id: Uuid,
    pub event_ids: Vec<String>,
    pub token_ceiling: VisibilityToken,
}

/// Queue-side half of the `/v1/lag` report; the caller merges in the
/// published watermark.
#[derive(Debug, Clone)]
pub struct QueueDepth {
    pub max_accepted_token: VisibilityToken,
    pub pending_rows: u64,
    pub oldest_accepted_age_ms: i64,
}

impl QueueDepth {
    pub fn into_lag(self, tenant_id: &str, published_token: VisibilityToken) -> LagSnapshot {
        LagSnapshot {
            tenant_id: tenant_id.to_string(),
            published_token,
            max_accepted_token: self.max_accepted_token,
            pending_rows: self.pending_rows,
            oldest_accepted_age_ms: self.oldest_accepted_age_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// IngestBus
// ---------------------------------------------------------------------------

/// Durable at-least-once queue of event envelopes.
///
/// Implementations must make `claim_batch` safe against concurrent
/// claimers (at most one consumer observes any given row as accepted) and
/// `ack`/`requeue_expired` race-safe against each other.
#[async_trait]
pub trait IngestBus: Send + Sync {
    /// Insert envelopes as ACCEPTED, deduplicating on
    /// `(tenant_id, table_id, idempotency_key, event_time)`. A duplicate
    /// returns `inserted = false` with the existing row's event_id and
    /// reservation.
    async fn publish(&self, events: Vec<Envelope>) -> Result<Vec<PublishResult>, BusError>;

    /// Atomically claim up to `limit` ACCEPTED rows of a single tenant,
    /// oldest first; the tenant is chosen round-robin among tenants with
    /// backlog so one backlogged tenant cannot starve the rest. Returns an
    /// empty batch when nothing is claimable.
    async fn claim_batch(
        &self,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError>;

    /// Same claim semantics pinned to one tenant; the per-tenant commit
    /// coordinator uses this so a batch never crosses its tenant lock.
    async fn claim_batch_for(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError>;

    /// Transition claimed rows to COMMITTED. Fails with `LeaseExpired` when
    /// the lease lapsed or the rows were re-claimed under a different batch.
    /// Re-acking a committed row is a no-op.
    async fn ack(&self, batch_id: Uuid, event_ids: &[String]) -> Result<(), BusError>;

    /// Return claimed rows to ACCEPTED with attempt+1, or quarantine them as
    /// FAILED once the attempt cap is reached.
    async fn nack(
        &self,
        batch_id: Uuid,
        event_ids: &[String],
        reason: NackReason,
    ) -> Result<(), BusError>;

    /// Push the batch lease forward. Fails with `LeaseExpired` if it already
    /// lapsed.
    async fn extend_lease(&self, batch_id: Uuid, lease_seconds: u64) -> Result<(), BusError>;

    /// Reaper: move every CLAIMED row with a lapsed lease back to ACCEPTED
    /// (or FAILED at the cap). Idempotent; safe to run concurrently with
    /// ack/extend_lease. Returns the number of rows moved.
    async fn requeue_expired(&self) -> Result<u64, BusError>;

    /// FAILED rows whose reservations still need a tombstone publication.
    async fn failed_unresolved(&self, tenant_id: &str) -> Result<Vec<FailedGroup>, BusError>;

    /// Record that a tombstone covering these rows was durably committed.
    async fn mark_failed_resolved(
        &self,
        tenant_id: &str,
        event_ids: &[String],
    ) -> Result<(), BusError>;

    /// Tenants that currently have ACCEPTED rows.
    async fn tenants_with_backlog(&self) -> Result<Vec<String>, BusError>;

    /// Queue-side lag numbers for one tenant.
    async fn depth(&self, tenant_id: &str) -> Result<QueueDepth, BusError>;

    /// Publish-notification channel: the value bumps on every successful
    /// publish. Poll-only backends return a receiver that never changes and
    /// rely on the coordinator's idle poll.
    fn subscribe_publishes(&self) -> watch::Receiver<u64>;
}
