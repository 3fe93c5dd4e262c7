//! Shared domain types for the DuckMesh write-visibility pipeline.
//!
//! Everything here is plain data: the bus, engine, coordinator and query
//! crates all speak these types and nothing else.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Per-tenant monotone commit position. The currency of read-after-write.
pub type VisibilityToken = i64;

/// Current wall time as unix milliseconds (all wire timestamps use this).
pub fn now_unix_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Row-level operation carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowOp {
    Insert,
    Upsert,
    Delete,
}

impl RowOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowOp::Insert => "insert",
            RowOp::Upsert => "upsert",
            RowOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(RowOp::Insert),
            "upsert" => Some(RowOp::Upsert),
            "delete" => Some(RowOp::Delete),
            _ => None,
        }
    }
}

/// A single producer-supplied event entering the bus.
///
/// `(tenant_id, table_id, idempotency_key)` keys the row's materialized
/// effect, so re-applying an envelope is safe. Publish dedup adds the event
/// time: a redelivered event drops, a new version of the same row inserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub tenant_id: String,
    pub table_id: String,
    pub idempotency_key: String,
    pub op: RowOp,
    /// Opaque typed row. Must be a JSON object for insert/upsert; anything
    /// else is classified as poison by the materializer.
    pub payload: Value,
    pub event_time_unix_ms: i64,
}

/// Per-event outcome of a publish call.
///
/// `visibility_token` is the token the event is expected to acquire on
/// commit (0 when the backend cannot reserve one). It is always >= the token
/// the event ultimately receives; producers use it as `min_visibility_token`
/// for a subsequent strict read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResult {
    pub event_id: String,
    pub inserted: bool,
    pub visibility_token: VisibilityToken,
}

// ---------------------------------------------------------------------------
// Queue rows
// ---------------------------------------------------------------------------

/// Durable state of a bus row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Accepted,
    Claimed,
    Committed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Accepted => "ACCEPTED",
            QueueState::Claimed => "CLAIMED",
            QueueState::Committed => "COMMITTED",
            QueueState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACCEPTED" => Some(QueueState::Accepted),
            "CLAIMED" => Some(QueueState::Claimed),
            "COMMITTED" => Some(QueueState::Committed),
            "FAILED" => Some(QueueState::Failed),
            _ => None,
        }
    }
}

/// Bus-internal durable record per envelope.
///
/// Lifecycle: ACCEPTED -(claim)-> CLAIMED -(ack)-> COMMITTED;
/// CLAIMED -(lease expiry | nack)-> ACCEPTED with attempt+1;
/// CLAIMED -(nack at attempt cap)-> FAILED.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub envelope: Envelope,
    pub state: QueueState,
    pub batch_id: Option<Uuid>,
    pub lease_token: Option<Uuid>,
    pub lease_until_unix_ms: Option<i64>,
    pub attempt: i32,
    /// Reserved at publish time; confirmed on commit. Doubles as the
    /// publish-result hint.
    pub visibility_token: Option<VisibilityToken>,
    pub created_unix_ms: i64,
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Transient grouping returned by a claim. All envelopes share one tenant.
#[derive(Debug, Clone)]
pub struct Batch {
    pub batch_id: Uuid,
    pub tenant_id: String,
    pub consumer_id: String,
    pub lease_token: Uuid,
    pub lease_until_unix_ms: i64,
    /// Max attempt among the claimed rows.
    pub attempt: i32,
    pub envelopes: Vec<Envelope>,
    pub claimed_unix_ms: i64,
    /// Largest publish-time token reservation among the claimed rows. The
    /// coordinator commits the batch at exactly this token.
    pub token_ceiling: VisibilityToken,
}

impl Batch {
    /// Empty sentinel returned when no rows are claimable.
    pub fn empty(consumer_id: &str) -> Self {
        Self {
            batch_id: Uuid::nil(),
            tenant_id: String::new(),
            consumer_id: consumer_id.to_string(),
            lease_token: Uuid::nil(),
            lease_until_unix_ms: 0,
            attempt: 0,
            envelopes: Vec::new(),
            claimed_unix_ms: 0,
            token_ceiling: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.envelopes.iter().map(|e| e.event_id.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Event store
// ---------------------------------------------------------------------------

/// One committed batch publication. Immutable once written; ordered by
/// `visibility_token` within a tenant.
///
/// A tombstone record reserves a token for a batch that exhausted its
/// attempts: it installs no rows but lets the watermark advance so strict
/// readers holding that batch's hint do not wait forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStoreRecord {
    pub tenant_id: String,
    pub visibility_token: VisibilityToken,
    pub batch_id: Uuid,
    pub committed_unix_ms: i64,
    pub event_ids: Vec<String>,
    pub tombstone: bool,
}

// ---------------------------------------------------------------------------
// Lag
// ---------------------------------------------------------------------------

/// Point-in-time ingestion lag for one tenant, served by GET /v1/lag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagSnapshot {
    pub tenant_id: String,
    pub published_token: VisibilityToken,
    /// Highest token reservation handed out so far (0 when the queue has
    /// never seen this tenant).
    pub max_accepted_token: VisibilityToken,
    pub pending_rows: u64,
    pub oldest_accepted_age_ms: i64,
}
