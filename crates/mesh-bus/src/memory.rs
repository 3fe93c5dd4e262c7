//! In-process bus backend.
//!
//! Models the log-broker variant of the contract: `lease_token` plays the
//! role of a broker delivery tag and dedup runs against an idempotency index
//! held outside the row log. All scenario tests run against this backend;
//! the relational backend runs the same suite under `MESH_DATABASE_URL`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use mesh_schemas::{
    now_unix_ms, Batch, Envelope, PublishResult, QueueRow, QueueState, VisibilityToken,
};

use crate::{BusError, FailedGroup, IngestBus, NackReason, QueueDepth};

#[derive(Default)]
struct TenantState {
    /// event_id -> row (all states).
    rows: HashMap<String, QueueRow>,
    /// ACCEPTED rows in claim order: (created_unix_ms, event_id).
    fifo: BTreeSet<(i64, String)>,
    /// (table_id, idempotency_key, event_time_unix_ms) -> event_id. A retry
    /// of the same event dedups; a new version of the row (new event time,
    /// same key) is a new event.
    dedup: HashMap<(String, String, i64), String>,
    /// Publish-time reservation counter; the last token handed out.
    last_token: VisibilityToken,
}

struct BatchMeta {
    tenant_id: String,
    lease_until_unix_ms: i64,
    event_ids: Vec<String>,
}

#[derive(Default)]
struct Inner {
    tenants: HashMap<String, TenantState>,
    batches: HashMap<Uuid, BatchMeta>,
    /// FAILED rows awaiting a tombstone, keyed by the batch they failed in.
    failed_unresolved: HashMap<(String, Uuid), Vec<String>>,
    /// Round-robin cursor for tenant selection.
    last_served: Option<String>,
    publish_count: u64,
}

pub struct MemoryBus {
    inner: Mutex<Inner>,
    max_attempts: i32,
    max_batch_bytes: usize,
    publish_tx: watch::Sender<u64>,
}

impl MemoryBus {
    pub fn new(max_attempts: i32, max_batch_bytes: usize) -> Self {
        let (publish_tx, _rx) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner::default()),
            max_attempts,
            max_batch_bytes,
            publish_tx,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, BusError> {
        self.inner
            .lock()
            .map_err(|_| BusError::Internal(anyhow!("bus state mutex poisoned")))
    }

    /// Round-robin among tenants with backlog: the next tenant id after the
    /// last served one, wrapping; a lone backlogged tenant always wins.
    fn pick_tenant(inner: &Inner) -> Option<String> {
        let mut candidates: Vec<&String> = inner
            .tenants
            .iter()
            .filter(|(_, st)| !st.fifo.is_empty())
            .map(|(id, _)| id)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();
        let next = match &inner.last_served {
            Some(last) => candidates.iter().find(|t| t.as_str() > last.as_str()),
            None => None,
        };
        Some(next.unwrap_or(&candidates[0]).to_string())
    }

    fn claim_inner(
        &self,
        tenant_filter: Option<&str>,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError> {
        let mut inner = self.lock()?;
        let tenant_id = match tenant_filter {
            Some(t) => {
                if inner
                    .tenants
                    .get(t)
                    .map(|st| st.fifo.is_empty())
                    .unwrap_or(true)
                {
                    return Ok(Batch::empty(consumer_id));
                }
                t.to_string()
            }
            None => {
                let Some(t) = Self::pick_tenant(&inner) else {
                    return Ok(Batch::empty(consumer_id));
                };
                inner.last_served = Some(t.clone());
                t
            }
        };

        let now = now_unix_ms();
        let batch_id = Uuid::new_v4();
        let lease_token = Uuid::new_v4();
        let lease_until = now + (lease_seconds as i64) * 1000;

        let tenant = inner
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BusError::Internal(anyhow!("tenant state vanished mid-claim")))?;

        let mut envelopes = Vec::new();
        let mut event_ids = Vec::new();
        let mut ceiling = 0;
        let mut attempt = 0;
        let mut bytes = 0usize;

        while envelopes.len() < limit {
            let Some((created, event_id)) = tenant.fifo.iter().next().cloned() else {
                break;
            };
            let Some(row) = tenant.rows.get(&event_id) else {
                tenant.fifo.remove(&(created, event_id));
                continue;
            };
            let row_bytes = row.envelope.payload.to_string().len();
            if !envelopes.is_empty() && bytes + row_bytes > self.max_batch_bytes {
                break;
            }
            tenant.fifo.remove(&(created, event_id.clone()));

            let row = tenant
                .rows
                .get_mut(&event_id)
                .ok_or_else(|| BusError::Internal(anyhow!("row vanished mid-claim")))?;
            row.state = QueueState::Claimed;
            row.batch_id = Some(batch_id);
            row.lease_token = Some(lease_token);
            row.lease_until_unix_ms = Some(lease_until);

            bytes += row_bytes;
            ceiling = ceiling.max(row.visibility_token.unwrap_or(0));
            attempt = attempt.max(row.attempt);
            envelopes.push(row.envelope.clone());
            event_ids.push(event_id);
        }

        if envelopes.is_empty() {
            return Ok(Batch::empty(consumer_id));
        }

        inner.batches.insert(
            batch_id,
            BatchMeta {
                tenant_id: tenant_id.clone(),
                lease_until_unix_ms: lease_until,
                event_ids,
            },
        );

        Ok(Batch {
            batch_id,
            tenant_id,
            consumer_id: consumer_id.to_string(),
            lease_token,
            lease_until_unix_ms: lease_until,
            attempt,
            envelopes,
            claimed_unix_ms: now,
            token_ceiling: ceiling,
        })
    }

    fn quarantine_or_requeue(
        max_attempts: i32,
        tenant: &mut TenantState,
        failed_unresolved: &mut HashMap<(String, Uuid), Vec<String>>,
        tenant_id: &str,
        batch_id: Uuid,
        event_id: &str,
    ) -> bool {
        let created;
        let failed;
        {
            let Some(row) = tenant.rows.get_mut(event_id) else {
                return false;
            };
            if row.state != QueueState::Claimed || row.batch_id != Some(batch_id) {
                return false;
            }
            failed = row.attempt >= max_attempts;
            created = row.created_unix_ms;
            if failed {
                row.state = QueueState::Failed;
            } else {
                row.state = QueueState::Accepted;
                row.attempt += 1;
            }
            row.batch_id = None;
            row.lease_token = None;
            row.lease_until_unix_ms = None;
        }
        if failed {
            failed_unresolved
                .entry((tenant_id.to_string(), batch_id))
                .or_default()
                .push(event_id.to_string());
        } else {
            tenant.fifo.insert((created, event_id.to_string()));
        }
        true
    }

    /// True once no row of `meta` is still claimed under `batch_id`.
    fn batch_settled(tenant: &TenantState, batch_id: Uuid, meta: &BatchMeta) -> bool {
        meta.event_ids.iter().all(|id| {
            tenant
                .rows
                .get(id)
                .map(|r| r.state != QueueState::Claimed || r.batch_id != Some(batch_id))
                .unwrap_or(true)
        })
    }
}

#[async_trait]
impl IngestBus for MemoryBus {
    async fn publish(&self, events: Vec<Envelope>) -> Result<Vec<PublishResult>, BusError> {
        let mut results = Vec::with_capacity(events.len());
        {
            let mut inner = self.lock()?;
            for env in events {
                let tenant = inner.tenants.entry(env.tenant_id.clone()).or_default();
                let key = (
                    env.table_id.clone(),
                    env.idempotency_key.clone(),
                    env.event_time_unix_ms,
                );
                if let Some(existing_id) = tenant.dedup.get(&key) {
                    let token = tenant
                        .rows
                        .get(existing_id)
                        .and_then(|r| r.visibility_token)
                        .unwrap_or(0);
                    results.push(PublishResult {
                        event_id: existing_id.clone(),
                        inserted: false,
                        visibility_token: token,
                    });
                    continue;
                }

                tenant.last_token += 1;
                let token = tenant.last_token;
                let event_id = env.event_id.clone();
                let created = now_unix_ms();
                tenant.rows.insert(
                    event_id.clone(),
                    QueueRow {
                        envelope: env,
                        state: QueueState::Accepted,
                        batch_id: None,
                        lease_token: None,
                        lease_until_unix_ms: None,
                        attempt: 1,
                        visibility_token: Some(token),
                        created_unix_ms: created,
                    },
                );
                tenant.fifo.insert((created, event_id.clone()));
                tenant.dedup.insert(key, event_id.clone());
                results.push(PublishResult {
                    event_id,
                    inserted: true,
                    visibility_token: token,
                });
            }
            inner.publish_count += 1;
            let count = inner.publish_count;
            drop(inner);
            let _ = self.publish_tx.send(count);
        }
        Ok(results)
    }

    async fn claim_batch(
        &self,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError> {
        self.claim_inner(None, consumer_id, limit, lease_seconds)
    }

    async fn claim_batch_for(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError> {
        self.claim_inner(Some(tenant_id), consumer_id, limit, lease_seconds)
    }

    async fn ack(&self, batch_id: Uuid, event_ids: &[String]) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        let now = now_unix_ms();

        let Some(meta) = inner.batches.get(&batch_id) else {
            // Batch already settled: a re-ack is a no-op only if every row
            // was committed under THIS batch. Rows committed by a later
            // claimer (or still in flight) mean this caller lost its lease.
            let all_committed_here = event_ids.iter().all(|id| {
                inner.tenants.values().any(|t| {
                    t.rows
                        .get(id)
                        .map(|r| {
                            r.state == QueueState::Committed && r.batch_id == Some(batch_id)
                        })
                        .unwrap_or(false)
                })
            });
            return if all_committed_here {
                Ok(())
            } else {
                Err(BusError::LeaseExpired)
            };
        };

        if meta.lease_until_unix_ms < now {
            return Err(BusError::LeaseExpired);
        }
        let tenant_id = meta.tenant_id.clone();

        let tenant = inner
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BusError::Internal(anyhow!("tenant state vanished mid-ack")))?;
        for event_id in event_ids {
            let Some(row) = tenant.rows.get_mut(event_id) else {
                continue;
            };
            match row.state {
                QueueState::Claimed if row.batch_id == Some(batch_id) => {
                    // Committed rows keep the batch that committed them so a
                    // re-ack from a lapsed claimer can be told apart.
                    row.state = QueueState::Committed;
                    row.lease_token = None;
                    row.lease_until_unix_ms = None;
                }
                QueueState::Committed if row.batch_id == Some(batch_id) => {}
                _ => return Err(BusError::LeaseExpired),
            }
        }

        let settled = match (inner.batches.get(&batch_id), inner.tenants.get(&tenant_id)) {
            (Some(meta), Some(tenant)) => Self::batch_settled(tenant, batch_id, meta),
            _ => true,
        };
        if settled {
            inner.batches.remove(&batch_id);
        }
        Ok(())
    }

    async fn nack(
        &self,
        batch_id: Uuid,
        event_ids: &[String],
        _reason: NackReason,
    ) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        let Some(meta) = inner.batches.get(&batch_id) else {
            return Ok(()); // lease already reaped; nothing left to return
        };
        let tenant_id = meta.tenant_id.clone();

        let Inner {
            tenants,
            failed_unresolved,
            ..
        } = &mut *inner;
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BusError::Internal(anyhow!("tenant state vanished mid-nack")))?;
        for event_id in event_ids {
            Self::quarantine_or_requeue(
                self.max_attempts,
                tenant,
                failed_unresolved,
                &tenant_id,
                batch_id,
                event_id,
            );
        }

        let settled = match (inner.batches.get(&batch_id), inner.tenants.get(&tenant_id)) {
            (Some(meta), Some(tenant)) => Self::batch_settled(tenant, batch_id, meta),
            _ => true,
        };
        if settled {
            inner.batches.remove(&batch_id);
        }
        Ok(())
    }

    async fn extend_lease(&self, batch_id: Uuid, lease_seconds: u64) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        let now = now_unix_ms();
        let new_until = now + (lease_seconds as i64) * 1000;

        let Some(meta) = inner.batches.get_mut(&batch_id) else {
            return Err(BusError::LeaseExpired);
        };
        if meta.lease_until_unix_ms < now {
            return Err(BusError::LeaseExpired);
        }
        meta.lease_until_unix_ms = new_until;
        let tenant_id = meta.tenant_id.clone();
        let ids = meta.event_ids.clone();

        if let Some(tenant) = inner.tenants.get_mut(&tenant_id) {
            for id in &ids {
                if let Some(row) = tenant.rows.get_mut(id) {
                    if row.batch_id == Some(batch_id) {
                        row.lease_until_unix_ms = Some(new_until);
                    }
                }
            }
        }
        Ok(())
    }

    async fn requeue_expired(&self) -> Result<u64, BusError> {
        let mut inner = self.lock()?;
        let now = now_unix_ms();
        let expired: Vec<Uuid> = inner
            .batches
            .iter()
            .filter(|(_, m)| m.lease_until_unix_ms < now)
            .map(|(id, _)| *id)
            .collect();

        let mut moved = 0u64;
        for batch_id in expired {
            let Some(meta) = inner.batches.remove(&batch_id) else {
                continue;
            };
            let Inner {
                tenants,
                failed_unresolved,
                ..
            } = &mut *inner;
            let Some(tenant) = tenants.get_mut(&meta.tenant_id) else {
                continue;
            };
            for event_id in &meta.event_ids {
                if Self::quarantine_or_requeue(
                    self.max_attempts,
                    tenant,
                    failed_unresolved,
                    &meta.tenant_id,
                    batch_id,
                    event_id,
                ) {
                    moved += 1;
                }
            }
        }
        Ok(moved)
    }

    async fn failed_unresolved(&self, tenant_id: &str) -> Result<Vec<FailedGroup>, BusError> {
        let inner = self.lock()?;
        let mut groups = Vec::new();
        for ((tid, batch_id), event_ids) in &inner.failed_unresolved {
            if tid != tenant_id || event_ids.is_empty() {
                continue;
            }
            let tenant = match inner.tenants.get(tid) {
                Some(t) => t,
                None => continue,
            };
            let ceiling = event_ids
                .iter()
                .filter_map(|id| tenant.rows.get(id).and_then(|r| r.visibility_token))
                .max()
                .unwrap_or(0);
            groups.push(FailedGroup {
                tenant_id: tid.clone(),
                batch_id: *batch_id,
                event_ids: event_ids.clone(),
                token_ceiling: ceiling,
            });
        }
        groups.sort_by_key(|g| g.token_ceiling);
        Ok(groups)
    }

    async fn mark_failed_resolved(
        &self,
        tenant_id: &str,
        event_ids: &[String],
    ) -> Result<(), BusError> {
        let mut inner = self.lock()?;
        for ids in inner
            .failed_unresolved
            .iter_mut()
            .filter(|((tid, _), _)| tid == tenant_id)
            .map(|(_, ids)| ids)
        {
            ids.retain(|id| !event_ids.contains(id));
        }
        inner.failed_unresolved.retain(|_, ids| !ids.is_empty());
        Ok(())
    }

    async fn tenants_with_backlog(&self) -> Result<Vec<String>, BusError> {
        let inner = self.lock()?;
        let mut tenants: Vec<String> = inner
            .tenants
            .iter()
            .filter(|(_, st)| !st.fifo.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        tenants.sort();
        Ok(tenants)
    }

    async fn depth(&self, tenant_id: &str) -> Result<QueueDepth, BusError> {
        let inner = self.lock()?;
        let Some(tenant) = inner.tenants.get(tenant_id) else {
            return Ok(QueueDepth {
                max_accepted_token: 0,
                pending_rows: 0,
                oldest_accepted_age_ms: 0,
            });
        };
        let now = now_unix_ms();
        let pending = tenant
            .rows
            .values()
            .filter(|r| matches!(r.state, QueueState::Accepted | QueueState::Claimed))
            .count() as u64;
        let oldest_age = tenant
            .fifo
            .iter()
            .next()
            .map(|(created, _)| (now - created).max(0))
            .unwrap_or(0);
        Ok(QueueDepth {
            max_accepted_token: tenant.last_token,
            pending_rows: pending,
            oldest_accepted_age_ms: oldest_age,
        })
    }

    fn subscribe_publishes(&self) -> watch::Receiver<u64> {
        self.publish_tx.subscribe()
    }
}
