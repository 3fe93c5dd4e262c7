//! PostgreSQL bus backend.
//!
//! One durable `ingest_queue` table carries the full row lifecycle; claims
//! go through a CTE with `FOR UPDATE SKIP LOCKED` so concurrent claimers
//! never observe the same ACCEPTED row, and publish dedup rides the
//! `(tenant_id, table_id, idempotency_key, event_time_unix_ms)` unique
//! constraint. Token
//! reservations come from the `tenant_sequence` counter updated in the same
//! transaction as the insert.
//!
//! The advisory-lock helpers back the per-tenant coordinator singleton in
//! multi-replica deployments.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use mesh_schemas::{now_unix_ms, Batch, Envelope, PublishResult, RowOp};

use crate::{BusError, FailedGroup, IngestBus, NackReason, QueueDepth, ENV_DB_URL};

/// Connect to Postgres using MESH_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("bus migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_ingest_queue: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='ingest_queue'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_ingest_queue: exists,
    })
}

fn store_err(e: sqlx::Error, what: &str) -> BusError {
    BusError::Unavailable(anyhow::Error::new(e).context(what.to_string()))
}

pub struct RelationalBus {
    pool: PgPool,
    max_attempts: i32,
    max_batch_bytes: usize,
    /// Round-robin cursor; advisory only, replicas keep their own.
    last_served: Mutex<Option<String>>,
    publish_tx: watch::Sender<u64>,
}

impl RelationalBus {
    pub fn new(pool: PgPool, max_attempts: i32, max_batch_bytes: usize) -> Self {
        let (publish_tx, _rx) = watch::channel(0u64);
        Self {
            pool,
            max_attempts,
            max_batch_bytes,
            last_served: Mutex::new(None),
            publish_tx,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Stable 64-bit key for pg advisory locks. FNV-1a: must agree across
    /// replicas, which rules out the process-seeded std hasher.
    pub fn tenant_lock_key(tenant_id: &str) -> i64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in tenant_id.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash as i64
    }

    /// Try to take the per-tenant coordinator lock (session scope).
    pub async fn try_tenant_lock(&self, tenant_id: &str) -> Result<bool, BusError> {
        let key = Self::tenant_lock_key(tenant_id);
        let row = sqlx::query("select pg_try_advisory_lock($1) as locked")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err(e, "try_tenant_lock failed"))?;
        row.try_get("locked")
            .map_err(|e| BusError::Internal(anyhow::Error::new(e)))
    }

    pub async fn release_tenant_lock(&self, tenant_id: &str) -> Result<bool, BusError> {
        let key = Self::tenant_lock_key(tenant_id);
        let row = sqlx::query("select pg_advisory_unlock($1) as unlocked")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err(e, "release_tenant_lock failed"))?;
        row.try_get("unlocked")
            .map_err(|e| BusError::Internal(anyhow::Error::new(e)))
    }

    async fn publish_one(&self, env: &Envelope) -> Result<PublishResult, BusError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err(e, "publish begin failed"))?;

        let existing = sqlx::query(
            r#"
            select event_id, visibility_token
            from ingest_queue
            where tenant_id = $1 and table_id = $2 and idempotency_key = $3
              and event_time_unix_ms = $4
            "#,
        )
        .bind(&env.tenant_id)
        .bind(&env.table_id)
        .bind(&env.idempotency_key)
        .bind(env.event_time_unix_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err(e, "publish dedup probe failed"))?;

        if let Some(row) = existing {
            let event_id: String = row
                .try_get("event_id")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            let token: Option<i64> = row
                .try_get("visibility_token")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            return Ok(PublishResult {
                event_id,
                inserted: false,
                visibility_token: token.unwrap_or(0),
            });
        }

        let token: i64 = sqlx::query(
            r#"
            insert into tenant_sequence (tenant_id, last_token)
            values ($1, 1)
            on conflict (tenant_id) do update
                set last_token = tenant_sequence.last_token + 1
            returning last_token
            "#,
        )
        .bind(&env.tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_err(e, "reserve token failed"))?
        .try_get("last_token")
        .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;

        let inserted = sqlx::query(
            r#"
            insert into ingest_queue (
              event_id, tenant_id, table_id, idempotency_key, op, payload,
              event_time_unix_ms, state, attempt, visibility_token, created_unix_ms
            ) values (
              $1, $2, $3, $4, $5, $6, $7, 'ACCEPTED', 1, $8, $9
            )
            on conflict (tenant_id, table_id, idempotency_key, event_time_unix_ms)
                do nothing
            returning event_id
            "#,
        )
        .bind(&env.event_id)
        .bind(&env.tenant_id)
        .bind(&env.table_id)
        .bind(&env.idempotency_key)
        .bind(env.op.as_str())
        .bind(&env.payload)
        .bind(env.event_time_unix_ms)
        .bind(token)
        .bind(now_unix_ms())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| store_err(e, "publish insert failed"))?;

        if inserted.is_none() {
            // Lost the dedup race to a concurrent publisher; surface theirs.
            // The reservation above rolls back with this transaction.
            tx.rollback()
                .await
                .map_err(|e| store_err(e, "publish rollback failed"))?;
            let row = sqlx::query(
                r#"
                select event_id, visibility_token
                from ingest_queue
                where tenant_id = $1 and table_id = $2 and idempotency_key = $3
                  and event_time_unix_ms = $4
                "#,
            )
            .bind(&env.tenant_id)
            .bind(&env.table_id)
            .bind(&env.idempotency_key)
            .bind(env.event_time_unix_ms)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err(e, "publish dedup re-probe failed"))?;
            let event_id: String = row
                .try_get("event_id")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            let token: Option<i64> = row
                .try_get("visibility_token")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            return Ok(PublishResult {
                event_id,
                inserted: false,
                visibility_token: token.unwrap_or(0),
            });
        }

        tx.commit()
            .await
            .map_err(|e| store_err(e, "publish commit failed"))?;

        Ok(PublishResult {
            event_id: env.event_id.clone(),
            inserted: true,
            visibility_token: token,
        })
    }

    async fn pick_tenant(&self) -> Result<Option<String>, BusError> {
        let rows = sqlx::query(
            r#"
            select tenant_id
            from ingest_queue
            where state = 'ACCEPTED'
            group by tenant_id
            order by tenant_id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "backlog tenant scan failed"))?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(
                row.try_get::<String, _>("tenant_id")
                    .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?,
            );
        }
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut cursor = self
            .last_served
            .lock()
            .map_err(|_| BusError::Internal(anyhow!("rr cursor mutex poisoned")))?;
        let chosen = match &*cursor {
            Some(last) => candidates
                .iter()
                .find(|t| t.as_str() > last.as_str())
                .unwrap_or(&candidates[0])
                .clone(),
            None => candidates[0].clone(),
        };
        *cursor = Some(chosen.clone());
        Ok(Some(chosen))
    }
}

fn envelope_from_row(row: &sqlx::postgres::PgRow) -> Result<(Envelope, i32, i64)> {
    let op_str: String = row.try_get("op")?;
    let op = RowOp::parse(&op_str).ok_or_else(|| anyhow!("unknown op in queue row: {op_str}"))?;
    let env = Envelope {
        event_id: row.try_get("event_id")?,
        tenant_id: row.try_get("tenant_id")?,
        table_id: row.try_get("table_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        op,
        payload: row.try_get("payload")?,
        event_time_unix_ms: row.try_get("event_time_unix_ms")?,
    };
    let attempt: i32 = row.try_get("attempt")?;
    let token: Option<i64> = row.try_get("visibility_token")?;
    Ok((env, attempt, token.unwrap_or(0)))
}

#[async_trait]
impl IngestBus for RelationalBus {
    async fn publish(&self, events: Vec<Envelope>) -> Result<Vec<PublishResult>, BusError> {
        let mut results = Vec::with_capacity(events.len());
        for env in &events {
            results.push(self.publish_one(env).await?);
        }
        self.publish_tx.send_modify(|n| *n += 1);
        Ok(results)
    }

    async fn claim_batch(
        &self,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError> {
        let Some(tenant_id) = self.pick_tenant().await? else {
            return Ok(Batch::empty(consumer_id));
        };
        self.claim_batch_for(&tenant_id, consumer_id, limit, lease_seconds)
            .await
    }

    async fn claim_batch_for(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        limit: usize,
        lease_seconds: u64,
    ) -> Result<Batch, BusError> {
        let tenant_id = tenant_id.to_string();
        let now = now_unix_ms();
        let batch_id = Uuid::new_v4();
        let lease_token = Uuid::new_v4();
        let lease_until = now + (lease_seconds as i64) * 1000;

        let rows = sqlx::query(
            r#"
            with to_claim as (
                select event_id
                from ingest_queue
                where tenant_id = $1 and state = 'ACCEPTED'
                order by created_unix_ms asc, event_id asc
                limit $2
                for update skip locked
            )
            update ingest_queue q
               set state               = 'CLAIMED',
                   batch_id            = $3,
                   lease_token         = $4,
                   lease_until_unix_ms = $5
             where q.event_id in (select event_id from to_claim)
            returning q.event_id, q.tenant_id, q.table_id, q.idempotency_key, q.op,
                      q.payload, q.event_time_unix_ms, q.attempt, q.visibility_token,
                      q.created_unix_ms
            "#,
        )
        .bind(&tenant_id)
        .bind(limit as i64)
        .bind(batch_id)
        .bind(lease_token)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "claim_batch failed"))?;

        if rows.is_empty() {
            return Ok(Batch::empty(consumer_id));
        }

        // UPDATE ... RETURNING order is unspecified; restore claim order.
        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let created: i64 = row
                .try_get("created_unix_ms")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            decoded.push((created, envelope_from_row(row).map_err(BusError::Internal)?));
        }
        decoded.sort_by(|(ca, (ea, _, _)), (cb, (eb, _, _))| {
            ca.cmp(cb).then_with(|| ea.event_id.cmp(&eb.event_id))
        });

        let mut envelopes = Vec::with_capacity(decoded.len());
        let mut overflow = Vec::new();
        let mut ceiling = 0i64;
        let mut attempt = 0i32;
        let mut bytes = 0usize;
        for (_, (env, row_attempt, token)) in decoded {
            let row_bytes = env.payload.to_string().len();
            if !envelopes.is_empty() && bytes + row_bytes > self.max_batch_bytes {
                overflow.push(env.event_id);
                continue;
            }
            bytes += row_bytes;
            ceiling = ceiling.max(token);
            attempt = attempt.max(row_attempt);
            envelopes.push(env);
        }

        if !overflow.is_empty() {
            // Byte cap enforced client-side: release the tail of the claim
            // without charging an attempt.
            sqlx::query(
                r#"
                update ingest_queue
                   set state = 'ACCEPTED', batch_id = null,
                       lease_token = null, lease_until_unix_ms = null
                 where batch_id = $1 and event_id = any($2)
                "#,
            )
            .bind(batch_id)
            .bind(&overflow)
            .execute(&self.pool)
            .await
            .map_err(|e| store_err(e, "claim overflow release failed"))?;
        }

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

    async fn ack(&self, batch_id: Uuid, event_ids: &[String]) -> Result<(), BusError> {
        let now = now_unix_ms();
        // Committed rows keep the batch that committed them so a re-ack from
        // a lapsed claimer can be told apart from an idempotent retry.
        let committed = sqlx::query(
            r#"
            update ingest_queue
               set state = 'COMMITTED',
                   lease_token = null, lease_until_unix_ms = null
             where batch_id = $1 and event_id = any($2)
               and state = 'CLAIMED' and lease_until_unix_ms >= $3
            returning event_id
            "#,
        )
        .bind(batch_id)
        .bind(event_ids)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "ack failed"))?;

        if committed.len() == event_ids.len() {
            return Ok(());
        }

        // Remainder must already be COMMITTED under this batch (idempotent
        // re-ack); anything else means the lease lapsed or the rows were
        // re-claimed.
        let row = sqlx::query(
            r#"
            select count(*) as n
            from ingest_queue
            where event_id = any($1) and state = 'COMMITTED' and batch_id = $2
            "#,
        )
        .bind(event_ids)
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err(e, "ack settle probe failed"))?;
        let n: i64 = row
            .try_get("n")
            .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
        if n as usize == event_ids.len() {
            Ok(())
        } else {
            Err(BusError::LeaseExpired)
        }
    }

    async fn nack(
        &self,
        batch_id: Uuid,
        event_ids: &[String],
        _reason: NackReason,
    ) -> Result<(), BusError> {
        sqlx::query(
            r#"
            update ingest_queue
               set state   = case when attempt >= $3 then 'FAILED' else 'ACCEPTED' end,
                   attempt = case when attempt >= $3 then attempt else attempt + 1 end,
                   batch_id = case when attempt >= $3 then batch_id else null end,
                   lease_token = null,
                   lease_until_unix_ms = null
             where batch_id = $1 and event_id = any($2) and state = 'CLAIMED'
            "#,
        )
        .bind(batch_id)
        .bind(event_ids)
        .bind(self.max_attempts)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err(e, "nack failed"))?;
        Ok(())
    }

    async fn extend_lease(&self, batch_id: Uuid, lease_seconds: u64) -> Result<(), BusError> {
        let now = now_unix_ms();
        let new_until = now + (lease_seconds as i64) * 1000;
        let rows = sqlx::query(
            r#"
            update ingest_queue
               set lease_until_unix_ms = $2
             where batch_id = $1 and state = 'CLAIMED' and lease_until_unix_ms >= $3
            returning event_id
            "#,
        )
        .bind(batch_id)
        .bind(new_until)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "extend_lease failed"))?;

        if rows.is_empty() {
            Err(BusError::LeaseExpired)
        } else {
            Ok(())
        }
    }

    async fn requeue_expired(&self) -> Result<u64, BusError> {
        let now = now_unix_ms();
        let rows = sqlx::query(
            r#"
            update ingest_queue
               set state   = case when attempt >= $2 then 'FAILED' else 'ACCEPTED' end,
                   attempt = case when attempt >= $2 then attempt else attempt + 1 end,
                   batch_id = case when attempt >= $2 then batch_id else null end,
                   lease_token = null,
                   lease_until_unix_ms = null
             where state = 'CLAIMED' and lease_until_unix_ms < $1
            returning event_id
            "#,
        )
        .bind(now)
        .bind(self.max_attempts)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "requeue_expired failed"))?;
        Ok(rows.len() as u64)
    }

    async fn failed_unresolved(&self, tenant_id: &str) -> Result<Vec<FailedGroup>, BusError> {
        let rows = sqlx::query(
            r#"
            select batch_id, event_id, visibility_token
            from ingest_queue
            where tenant_id = $1 and state = 'FAILED' and resolved_unix_ms is null
            order by visibility_token asc
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "failed_unresolved scan failed"))?;

        let mut groups: Vec<FailedGroup> = Vec::new();
        for row in rows {
            let batch_id: Option<Uuid> = row
                .try_get("batch_id")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            let event_id: String = row
                .try_get("event_id")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            let token: Option<i64> = row
                .try_get("visibility_token")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
            let batch_id = batch_id.unwrap_or(Uuid::nil());
            let token = token.unwrap_or(0);
            match groups.iter_mut().find(|g| g.batch_id == batch_id) {
                Some(g) => {
                    g.event_ids.push(event_id);
                    g.token_ceiling = g.token_ceiling.max(token);
                }
                None => groups.push(FailedGroup {
                    tenant_id: tenant_id.to_string(),
                    batch_id,
                    event_ids: vec![event_id],
                    token_ceiling: token,
                }),
            }
        }
        groups.sort_by_key(|g| g.token_ceiling);
        Ok(groups)
    }

    async fn mark_failed_resolved(
        &self,
        tenant_id: &str,
        event_ids: &[String],
    ) -> Result<(), BusError> {
        sqlx::query(
            r#"
            update ingest_queue
               set resolved_unix_ms = $3
             where tenant_id = $1 and event_id = any($2) and state = 'FAILED'
            "#,
        )
        .bind(tenant_id)
        .bind(event_ids)
        .bind(now_unix_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| store_err(e, "mark_failed_resolved failed"))?;
        Ok(())
    }

    async fn tenants_with_backlog(&self) -> Result<Vec<String>, BusError> {
        let rows = sqlx::query(
            r#"
            select distinct tenant_id
            from ingest_queue
            where state = 'ACCEPTED'
            order by tenant_id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err(e, "tenants_with_backlog failed"))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(
                row.try_get::<String, _>("tenant_id")
                    .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?,
            );
        }
        Ok(out)
    }

    async fn depth(&self, tenant_id: &str) -> Result<QueueDepth, BusError> {
        let now = now_unix_ms();
        let row = sqlx::query(
            r#"
            select
              count(*) filter (where state in ('ACCEPTED','CLAIMED')) as pending,
              min(created_unix_ms) filter (where state = 'ACCEPTED') as oldest
            from ingest_queue
            where tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| store_err(e, "depth scan failed"))?;

        let pending: i64 = row
            .try_get("pending")
            .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;
        let oldest: Option<i64> = row
            .try_get("oldest")
            .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?;

        let seq = sqlx::query(
            r#"
            select last_token from tenant_sequence where tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err(e, "sequence read failed"))?;
        let max_token: i64 = match seq {
            Some(r) => r
                .try_get("last_token")
                .map_err(|e| BusError::Internal(anyhow::Error::new(e)))?,
            None => 0,
        };

        Ok(QueueDepth {
            max_accepted_token: max_token,
            pending_rows: pending as u64,
            oldest_accepted_age_ms: oldest.map(|o| (now - o).max(0)).unwrap_or(0),
        })
    }

    fn subscribe_publishes(&self) -> watch::Receiver<u64> {
        self.publish_tx.subscribe()
    }
}
