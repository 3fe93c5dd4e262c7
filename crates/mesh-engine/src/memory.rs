//! In-memory engine backend.
//!
//! Stands in for the embedded columnar engine in tests and single-process
//! deployments. Storage is a per-(tenant, table) map of version chains keyed
//! by idempotency key; a snapshot at token T observes, per key, the latest
//! version with commit token <= T. Pinned snapshot tokens form a floor below
//! which compaction will not reclaim versions.
//!
//! The SQL surface is deliberately narrow (`SELECT count(*) FROM t`,
//! `SELECT * FROM t`): full SQL execution belongs to the real engine.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use mesh_schemas::{now_unix_ms, EventStoreRecord, RowOp, VisibilityToken};

use crate::event_log::{EventLog, LogAppendError};
use crate::{CommitOutcome, EngineError, EngineTxn, QueryOutput, Snapshot, TableEngine};

struct Version {
    token: VisibilityToken,
    /// Bumped by maintenance rewrites; ordered lexicographically with the
    /// token so chains stay append-ordered.
    generation: u64,
    /// None marks a deletion.
    payload: Option<Value>,
    event_time_unix_ms: i64,
}

type TableData = BTreeMap<String, Vec<Version>>;

#[derive(Default)]
struct TenantStore {
    tables: BTreeMap<String, TableData>,
    log: EventLog,
    /// Storage artifact generation; retention bumps it so only snapshots
    /// opened afterwards observe the rewrite.
    generation: u64,
}

#[derive(Default)]
struct Shared {
    tenants: RwLock<HashMap<String, TenantStore>>,
    /// (tenant, token, generation) -> pin count.
    pins: Mutex<BTreeMap<(String, VisibilityToken, u64), usize>>,
}

impl Shared {
    /// Oldest live pin for a tenant as (min token, min generation).
    fn min_pinned(&self, tenant_id: &str) -> Option<(VisibilityToken, u64)> {
        let pins = self.pins.lock().ok()?;
        let mut min_token = None;
        let mut min_gen = None;
        for ((t, tok, generation), n) in pins.iter() {
            if t != tenant_id || *n == 0 {
                continue;
            }
            min_token = Some(min_token.map_or(*tok, |m: VisibilityToken| m.min(*tok)));
            min_gen = Some(min_gen.map_or(*generation, |m: u64| m.min(*generation)));
        }
        Some((min_token?, min_gen?))
    }
}

/// Releases a snapshot pin on drop.
struct PinGuard {
    shared: Arc<Shared>,
    key: (String, VisibilityToken, u64),
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if let Ok(mut pins) = self.shared.pins.lock() {
            if let Some(n) = pins.get_mut(&self.key) {
                *n -= 1;
                if *n == 0 {
                    pins.remove(&self.key);
                }
            }
        }
    }
}

#[derive(Default, Clone)]
pub struct MemoryEngine {
    shared: Arc<Shared>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pins for a tenant (test observability).
    pub fn pinned_count(&self, tenant_id: &str) -> usize {
        self.shared
            .pins
            .lock()
            .map(|p| {
                p.iter()
                    .filter(|((t, _, _), n)| t == tenant_id && **n > 0)
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn lock_err() -> EngineError {
    EngineError::Fatal(anyhow!("engine state lock poisoned"))
}

/// Latest version visible to a snapshot at (token, generation), if it is a
/// live row.
fn visible<'a>(
    chain: &'a [Version],
    token: VisibilityToken,
    generation: u64,
) -> Option<&'a Version> {
    chain
        .iter()
        .rev()
        .find(|v| v.token <= token && v.generation <= generation)
        .filter(|v| v.payload.is_some())
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

struct StagedOp {
    table_id: String,
    idempotency_key: String,
    payload: Option<Value>,
    event_time_unix_ms: i64,
}

pub struct MemoryTxn {
    shared: Arc<Shared>,
    tenant_id: String,
    staged: Vec<StagedOp>,
}

#[async_trait]
impl EngineTxn for MemoryTxn {
    fn apply(
        &mut self,
        table_id: &str,
        op: RowOp,
        idempotency_key: &str,
        payload: &Value,
        event_time_unix_ms: i64,
    ) -> Result<(), EngineError> {
        let payload = match op {
            RowOp::Insert | RowOp::Upsert => {
                if !payload.is_object() {
                    return Err(EngineError::SchemaMismatch(format!(
                        "payload for {}/{idempotency_key} is not a row object",
                        table_id
                    )));
                }
                Some(payload.clone())
            }
            RowOp::Delete => None,
        };
        self.staged.push(StagedOp {
            table_id: table_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            payload,
            event_time_unix_ms,
        });
        Ok(())
    }

    async fn commit(
        self: Box<Self>,
        batch_id: Uuid,
        token_ceiling: VisibilityToken,
        event_ids: Vec<String>,
        tombstone: bool,
    ) -> Result<CommitOutcome, EngineError> {
        let mut tenants = self.shared.tenants.write().map_err(|_| lock_err())?;
        let store = tenants.entry(self.tenant_id.clone()).or_default();

        let record = EventStoreRecord {
            tenant_id: self.tenant_id.clone(),
            visibility_token: token_ceiling,
            batch_id,
            committed_unix_ms: now_unix_ms(),
            event_ids,
            tombstone,
        };
        match store.log.append(record) {
            Ok(()) => {}
            Err(LogAppendError::DuplicateBatch(tok)) => {
                return Ok(CommitOutcome::AlreadyCommitted(tok));
            }
            Err(LogAppendError::StaleToken(last)) => {
                // The token range is already durable: an earlier incarnation
                // of this batch committed and died before its ack landed.
                return Ok(CommitOutcome::AlreadyCommitted(last));
            }
        }

        if !tombstone {
            let generation = store.generation;
            for op in self.staged {
                let chain = store
                    .tables
                    .entry(op.table_id)
                    .or_default()
                    .entry(op.idempotency_key)
                    .or_default();
                chain.push(Version {
                    token: token_ceiling,
                    generation,
                    payload: op.payload,
                    event_time_unix_ms: op.event_time_unix_ms,
                });
            }
        }

        Ok(CommitOutcome::Committed(token_ceiling))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[async_trait]
impl TableEngine for MemoryEngine {
    async fn begin(&self, tenant_id: &str) -> Result<Box<dyn EngineTxn>, EngineError> {
        Ok(Box::new(MemoryTxn {
            shared: Arc::clone(&self.shared),
            tenant_id: tenant_id.to_string(),
            staged: Vec::new(),
        }))
    }

    async fn snapshot(
        &self,
        tenant_id: &str,
        token: VisibilityToken,
    ) -> Result<Snapshot, EngineError> {
        let generation = {
            let tenants = self.shared.tenants.read().map_err(|_| lock_err())?;
            tenants.get(tenant_id).map(|s| s.generation).unwrap_or(0)
        };
        {
            let mut pins = self.shared.pins.lock().map_err(|_| lock_err())?;
            *pins
                .entry((tenant_id.to_string(), token, generation))
                .or_insert(0) += 1;
        }
        let guard = PinGuard {
            shared: Arc::clone(&self.shared),
            key: (tenant_id.to_string(), token, generation),
        };
        Ok(Snapshot::new(
            tenant_id.to_string(),
            token,
            generation,
            Box::new(guard),
        ))
    }

    async fn execute(&self, snapshot: &Snapshot, sql: &str) -> Result<QueryOutput, EngineError> {
        let tenants = self.shared.tenants.read().map_err(|_| lock_err())?;
        let empty = TenantStore::default();
        let store = tenants.get(snapshot.tenant_id()).unwrap_or(&empty);

        let stmt = parse_select(sql)
            .ok_or_else(|| EngineError::SchemaMismatch(format!("unsupported sql: {sql}")))?;

        let table = store.tables.get(&stmt.table_id);
        let visible_rows: Vec<&Value> = table
            .map(|t| {
                t.values()
                    .filter_map(|chain| visible(chain, snapshot.token(), snapshot.generation()))
                    .filter_map(|v| v.payload.as_ref())
                    .collect()
            })
            .unwrap_or_default();

        if stmt.count_only {
            return Ok(QueryOutput {
                columns: vec!["count".to_string()],
                rows: vec![vec![Value::from(visible_rows.len() as u64)]],
            });
        }

        let mut columns: Vec<String> = Vec::new();
        for row in &visible_rows {
            if let Some(obj) = row.as_object() {
                for k in obj.keys() {
                    if !columns.contains(k) {
                        columns.push(k.clone());
                    }
                }
            }
        }
        columns.sort();

        let rows = visible_rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Ok(QueryOutput { columns, rows })
    }

    async fn max_committed_token(&self, tenant_id: &str) -> Result<VisibilityToken, EngineError> {
        let tenants = self.shared.tenants.read().map_err(|_| lock_err())?;
        Ok(tenants
            .get(tenant_id)
            .map(|s| s.log.last_token())
            .unwrap_or(0))
    }

    async fn records(&self, tenant_id: &str) -> Result<Vec<EventStoreRecord>, EngineError> {
        let tenants = self.shared.tenants.read().map_err(|_| lock_err())?;
        Ok(tenants
            .get(tenant_id)
            .map(|s| s.log.records().to_vec())
            .unwrap_or_default())
    }

    async fn tables(&self, snapshot: &Snapshot) -> Result<Vec<String>, EngineError> {
        let tenants = self.shared.tenants.read().map_err(|_| lock_err())?;
        let Some(store) = tenants.get(snapshot.tenant_id()) else {
            return Ok(Vec::new());
        };
        Ok(store
            .tables
            .iter()
            .filter(|(_, data)| {
                data.values()
                    .any(|chain| visible(chain, snapshot.token(), snapshot.generation()).is_some())
            })
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn compact(
        &self,
        tenant_id: &str,
        visible_floor: VisibilityToken,
    ) -> Result<u64, EngineError> {
        // New pins always open at or above the caller's watermark, so the
        // effective floor is the older of the oldest live pin and that
        // watermark. Versions shadowed below it are unobservable.
        let mut tenants = self.shared.tenants.write().map_err(|_| lock_err())?;
        let Some(store) = tenants.get_mut(tenant_id) else {
            return Ok(0);
        };
        let (pin_token, pin_gen) = self
            .shared
            .min_pinned(tenant_id)
            .unwrap_or((visible_floor, store.generation));
        let floor_token = pin_token.min(visible_floor);
        let floor_gen = pin_gen.min(store.generation);

        let mut pruned = 0u64;
        for data in store.tables.values_mut() {
            for chain in data.values_mut() {
                // Keep the newest version the oldest observer can see and
                // everything after it.
                let keep_from = chain
                    .iter()
                    .rposition(|v| v.token <= floor_token && v.generation <= floor_gen)
                    .unwrap_or(0);
                if keep_from > 0 {
                    pruned += keep_from as u64;
                    chain.drain(..keep_from);
                }
            }
            data.retain(|_, chain| !chain.is_empty());
        }
        Ok(pruned)
    }

    async fn retain(&self, tenant_id: &str, horizon_unix_ms: i64) -> Result<u64, EngineError> {
        let mut tenants = self.shared.tenants.write().map_err(|_| lock_err())?;
        let Some(store) = tenants.get_mut(tenant_id) else {
            return Ok(0);
        };
        // Copy-on-write: the markers land in a fresh generation at the same
        // token, so snapshots opened before this call keep their view and
        // only snapshots opened afterwards observe the removal.
        let token = store.log.last_token();
        store.generation += 1;
        let generation = store.generation;
        let mut retired = 0u64;
        for data in store.tables.values_mut() {
            for chain in data.values_mut() {
                let expired = chain
                    .last()
                    .map(|v| v.payload.is_some() && v.event_time_unix_ms < horizon_unix_ms)
                    .unwrap_or(false);
                if expired {
                    chain.push(Version {
                        token,
                        generation,
                        payload: None,
                        event_time_unix_ms: horizon_unix_ms,
                    });
                    retired += 1;
                }
            }
        }
        Ok(retired)
    }
}

// ---------------------------------------------------------------------------
// SQL subset
// ---------------------------------------------------------------------------

struct SelectStmt {
    table_id: String,
    count_only: bool,
}

/// `select count(*) from <t>` | `select * from <t>`, case-insensitive.
fn parse_select(sql: &str) -> Option<SelectStmt> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let lower = trimmed.to_ascii_lowercase();
    let rest = lower.strip_prefix("select")?.trim_start();

    let (count_only, rest) = if let Some(r) = rest.strip_prefix("count(*)") {
        (true, r.trim_start())
    } else if let Some(r) = rest.strip_prefix('*') {
        (false, r.trim_start())
    } else {
        return None;
    };

    let after_from = rest.strip_prefix("from")?.trim_start();
    if after_from.is_empty() || after_from.split_whitespace().count() != 1 {
        return None;
    }

    // Recover the original-case table name from the tail of the input.
    let table_id = trimmed
        .split_whitespace()
        .last()
        .map(|s| s.to_string())?;
    Some(SelectStmt {
        table_id,
        count_only,
    })
}
