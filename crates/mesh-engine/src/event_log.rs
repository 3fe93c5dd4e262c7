//! Per-tenant event store: append log of committed batch publications plus
//! the visibility counter, mutated only inside an engine commit.

use std::collections::HashMap;
use uuid::Uuid;

use mesh_schemas::{EventStoreRecord, VisibilityToken};

/// Why an append was refused. Both cases mean the token range is already
/// durable and the caller should treat the batch as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAppendError {
    /// `(tenant, batch_id)` already has a record at this token.
    DuplicateBatch(VisibilityToken),
    /// The requested token does not advance the counter.
    StaleToken(VisibilityToken),
}

/// Append-only record log for one tenant, ordered by visibility token.
#[derive(Default)]
pub struct EventLog {
    records: Vec<EventStoreRecord>,
    by_batch: HashMap<Uuid, VisibilityToken>,
    last_token: VisibilityToken,
}

impl EventLog {
    pub fn last_token(&self) -> VisibilityToken {
        self.last_token
    }

    pub fn token_for_batch(&self, batch_id: Uuid) -> Option<VisibilityToken> {
        self.by_batch.get(&batch_id).copied()
    }

    pub fn records(&self) -> &[EventStoreRecord] {
        &self.records
    }

    /// Append a record whose token must strictly advance the counter.
    pub fn append(&mut self, record: EventStoreRecord) -> Result<(), LogAppendError> {
        if let Some(tok) = self.by_batch.get(&record.batch_id) {
            return Err(LogAppendError::DuplicateBatch(*tok));
        }
        if record.visibility_token <= self.last_token {
            return Err(LogAppendError::StaleToken(self.last_token));
        }
        self.by_batch
            .insert(record.batch_id, record.visibility_token);
        self.last_token = record.visibility_token;
        self.records.push(record);
        Ok(())
    }
}
