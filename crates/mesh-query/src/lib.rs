//! Query barrier: the read-path gate in front of the engine.
//!
//! A query optionally waits until the tenant watermark reaches its
//! `min_visibility_token` (bounded, never unbounded), then executes against
//! a snapshot pinned at the current watermark. The snapshot is released on
//! every exit path; the pin is RAII, so cancellation mid-wait or mid-read
//! cannot leak it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use mesh_engine::{EngineError, TableEngine};
use mesh_schemas::VisibilityToken;
use mesh_watermark::WatermarkRegistry;

/// Read-path failure classes.
#[derive(Debug)]
pub enum QueryError {
    /// The watermark never reached `min_visibility_token` inside the bound;
    /// carries what was observed so the caller can retry or relax.
    BarrierTimeout {
        min_visibility_token: VisibilityToken,
        observed: VisibilityToken,
    },
    /// The SQL is outside the engine's surface or mismatched the schema.
    Rejected(String),
    /// Engine-side failure executing the snapshot read.
    Engine(EngineError),
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::BarrierTimeout {
                min_visibility_token,
                observed,
            } => write!(
                f,
                "barrier timeout: watermark {observed} below requested {min_visibility_token}"
            ),
            QueryError::Rejected(m) => write!(f, "query rejected: {m}"),
            QueryError::Engine(e) => write!(f, "query failed: {e}"),
        }
    }
}

impl std::error::Error for QueryError {}

/// Per-query options carried by POST /v1/query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOpts {
    pub min_visibility_token: Option<VisibilityToken>,
    pub barrier_timeout_ms: Option<u64>,
}

/// Result of a barriered query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub snapshot_token: VisibilityToken,
}

pub struct QueryGate {
    engine: Arc<dyn TableEngine>,
    watermarks: Arc<WatermarkRegistry>,
    default_timeout: Duration,
}

impl QueryGate {
    pub fn new(
        engine: Arc<dyn TableEngine>,
        watermarks: Arc<WatermarkRegistry>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            watermarks,
            default_timeout,
        }
    }

    pub async fn query(
        &self,
        tenant_id: &str,
        sql: &str,
        opts: QueryOpts,
    ) -> Result<QueryResponse, QueryError> {
        if let Some(min_token) = opts.min_visibility_token {
            let timeout = opts
                .barrier_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.default_timeout);
            let outcome = self.watermarks.wait(tenant_id, min_token, timeout).await;
            if outcome.timed_out {
                return Err(QueryError::BarrierTimeout {
                    min_visibility_token: min_token,
                    observed: outcome.reached,
                });
            }
            debug!(tenant_id, min_token, reached = outcome.reached, "barrier released");
        }

        let token = self.watermarks.current(tenant_id);
        let snapshot = self
            .engine
            .snapshot(tenant_id, token)
            .await
            .map_err(QueryError::Engine)?;

        let out = match self.engine.execute(&snapshot, sql).await {
            Ok(out) => out,
            Err(EngineError::SchemaMismatch(m)) => return Err(QueryError::Rejected(m)),
            Err(e) => return Err(QueryError::Engine(e)),
        };

        Ok(QueryResponse {
            columns: out.columns,
            rows: out.rows,
            snapshot_token: snapshot.token(),
        })
    }
}
