//! Stateless materializer: turns a claimed batch of envelopes into staged
//! engine effects inside an open transaction.
//!
//! Within a batch the last op per idempotency key wins, ordered by
//! `(event_time_unix_ms, claim position)`; commutativity under the key makes
//! any other batch-internal ordering immaterial. Envelopes arrive from the
//! bus already in stable claim order (created time, then event id).

use std::collections::HashMap;

use serde_json::Value;

use mesh_schemas::{Envelope, RowOp};

use crate::{EngineError, EngineTxn};

/// Apply failure classes; the coordinator maps them onto nack reasons.
#[derive(Debug)]
pub enum MaterializeError {
    /// Poison: the batch can never apply (bad payload, bad table).
    SchemaMismatch(String),
    /// Retryable: the engine refused transiently.
    Busy(String),
    /// Halt the tenant coordinator and alert.
    Fatal(anyhow::Error),
}

impl std::fmt::Display for MaterializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaterializeError::SchemaMismatch(m) => write!(f, "schema mismatch: {m}"),
            MaterializeError::Busy(m) => write!(f, "engine busy: {m}"),
            MaterializeError::Fatal(e) => write!(f, "engine fatal: {e}"),
        }
    }
}

impl std::error::Error for MaterializeError {}

impl From<EngineError> for MaterializeError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::SchemaMismatch(m) => MaterializeError::SchemaMismatch(m),
            EngineError::Busy(m) => MaterializeError::Busy(m),
            EngineError::Fatal(e) => MaterializeError::Fatal(e),
        }
    }
}

impl MaterializeError {
    pub fn is_poison(&self) -> bool {
        matches!(self, MaterializeError::SchemaMismatch(_))
    }
}

/// Stage every winning envelope of the batch into `txn`.
///
/// Validation happens before any staging so a poison batch never leaves a
/// half-staged transaction behind.
pub fn apply_batch(
    txn: &mut dyn EngineTxn,
    envelopes: &[Envelope],
) -> Result<(), MaterializeError> {
    for env in envelopes {
        validate(env)?;
    }

    // Winner per (table, key): max (event_time, claim position).
    let mut winners: HashMap<(&str, &str), usize> = HashMap::new();
    for (pos, env) in envelopes.iter().enumerate() {
        let key = (env.table_id.as_str(), env.idempotency_key.as_str());
        match winners.get(&key) {
            Some(&prev) if envelopes[prev].event_time_unix_ms > env.event_time_unix_ms => {}
            _ => {
                winners.insert(key, pos);
            }
        }
    }

    for (pos, env) in envelopes.iter().enumerate() {
        let key = (env.table_id.as_str(), env.idempotency_key.as_str());
        if winners.get(&key) != Some(&pos) {
            continue;
        }
        txn.apply(
            &env.table_id,
            env.op,
            &env.idempotency_key,
            &env.payload,
            env.event_time_unix_ms,
        )?;
    }
    Ok(())
}

fn validate(env: &Envelope) -> Result<(), MaterializeError> {
    if env.table_id.is_empty() || env.idempotency_key.is_empty() {
        return Err(MaterializeError::SchemaMismatch(format!(
            "event {} missing table or idempotency key",
            env.event_id
        )));
    }
    match env.op {
        RowOp::Insert | RowOp::Upsert => {
            if !env.payload.is_object() {
                return Err(MaterializeError::SchemaMismatch(format!(
                    "event {} payload is not a row object",
                    env.event_id
                )));
            }
        }
        RowOp::Delete => {}
    }
    Ok(())
}

/// Convenience for tests and callers that build envelopes inline.
pub fn envelope(
    event_id: &str,
    tenant_id: &str,
    table_id: &str,
    idempotency_key: &str,
    op: RowOp,
    payload: Value,
    event_time_unix_ms: i64,
) -> Envelope {
    Envelope {
        event_id: event_id.to_string(),
        tenant_id: tenant_id.to_string(),
        table_id: table_id.to_string(),
        idempotency_key: idempotency_key.to_string(),
        op,
        payload,
        event_time_unix_ms,
    }
}
