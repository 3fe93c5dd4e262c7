//! Typed view of the `/core` config subtree consumed by the pipeline.

use serde_json::Value;

/// Tunables of the write-visibility pipeline with deployment defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Per claim row upper bound.
    pub max_batch_rows: usize,
    /// Per claim byte cap over serialized payloads.
    pub max_batch_bytes: usize,
    /// Batch lease duration.
    pub lease_seconds: u64,
    /// Attempts before a row is quarantined as FAILED.
    pub max_attempts: i32,
    /// Coordinator idle sleep when the queue is empty.
    pub idle_poll_ms: u64,
    /// Barrier wait used when a query supplies no explicit timeout.
    pub barrier_default_timeout_ms: u64,
    /// Concurrent engine write transactions per tenant.
    pub max_engine_writers: usize,
    /// Concurrent engine write transactions across all tenants.
    pub max_engine_writers_global: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: 1024,
            max_batch_bytes: 8 * 1024 * 1024,
            lease_seconds: 30,
            max_attempts: 5,
            idle_poll_ms: 200,
            barrier_default_timeout_ms: 5000,
            max_engine_writers: 1,
            max_engine_writers_global: 8,
        }
    }
}

fn cfg_u64(v: &Value, ptr: &str) -> Option<u64> {
    v.pointer(ptr).and_then(|x| x.as_u64())
}

impl CoreConfig {
    /// Read from merged config JSON; absent keys keep their defaults.
    pub fn from_value(v: &Value) -> Self {
        let d = Self::default();
        Self {
            max_batch_rows: cfg_u64(v, "/core/max_batch_rows")
                .map(|n| n as usize)
                .unwrap_or(d.max_batch_rows),
            max_batch_bytes: cfg_u64(v, "/core/max_batch_bytes")
                .map(|n| n as usize)
                .unwrap_or(d.max_batch_bytes),
            lease_seconds: cfg_u64(v, "/core/lease_seconds").unwrap_or(d.lease_seconds),
            max_attempts: cfg_u64(v, "/core/max_attempts")
                .map(|n| n as i32)
                .unwrap_or(d.max_attempts),
            idle_poll_ms: cfg_u64(v, "/core/idle_poll_ms").unwrap_or(d.idle_poll_ms),
            barrier_default_timeout_ms: cfg_u64(v, "/core/barrier_default_timeout_ms")
                .unwrap_or(d.barrier_default_timeout_ms),
            max_engine_writers: cfg_u64(v, "/core/max_engine_writers")
                .map(|n| n as usize)
                .unwrap_or(d.max_engine_writers),
            max_engine_writers_global: cfg_u64(v, "/core/max_engine_writers_global")
                .map(|n| n as usize)
                .unwrap_or(d.max_engine_writers_global),
        }
    }

    /// Apply `MESH_*` environment overrides on top of the file layers.
    /// Unparsable values are ignored rather than failing boot.
    pub fn with_env_overrides(mut self) -> Self {
        fn env_u64(key: &str) -> Option<u64> {
            std::env::var(key).ok()?.parse().ok()
        }
        if let Some(n) = env_u64("MESH_MAX_BATCH_ROWS") {
            self.max_batch_rows = n as usize;
        }
        if let Some(n) = env_u64("MESH_MAX_BATCH_BYTES") {
            self.max_batch_bytes = n as usize;
        }
        if let Some(n) = env_u64("MESH_LEASE_SECONDS") {
            self.lease_seconds = n;
        }
        if let Some(n) = env_u64("MESH_MAX_ATTEMPTS") {
            self.max_attempts = n as i32;
        }
        if let Some(n) = env_u64("MESH_IDLE_POLL_MS") {
            self.idle_poll_ms = n;
        }
        if let Some(n) = env_u64("MESH_BARRIER_DEFAULT_TIMEOUT_MS") {
            self.barrier_default_timeout_ms = n;
        }
        if let Some(n) = env_u64("MESH_MAX_ENGINE_WRITERS") {
            self.max_engine_writers = n as usize;
        }
        if let Some(n) = env_u64("MESH_MAX_ENGINE_WRITERS_GLOBAL") {
            self.max_engine_writers_global = n as usize;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_deployment_contract() {
        let d = CoreConfig::default();
        assert_eq!(d.max_batch_rows, 1024);
        assert_eq!(d.max_batch_bytes, 8 * 1024 * 1024);
        assert_eq!(d.lease_seconds, 30);
        assert_eq!(d.max_attempts, 5);
        assert_eq!(d.idle_poll_ms, 200);
        assert_eq!(d.barrier_default_timeout_ms, 5000);
        assert_eq!(d.max_engine_writers, 1);
        assert_eq!(d.max_engine_writers_global, 8);
    }

    #[test]
    fn from_value_reads_partial_subtree() {
        let v = json!({"core": {"max_batch_rows": 16, "max_attempts": 3}});
        let c = CoreConfig::from_value(&v);
        assert_eq!(c.max_batch_rows, 16);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.lease_seconds, 30);
    }
}
