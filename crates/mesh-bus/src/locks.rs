//! Per-tenant advisory locks.
//!
//! Two layers per tenant:
//! - a singleton mutex among coordinators (one coordinator makes forward
//!   progress per tenant);
//! - a phase RwLock shared with maintenance: the coordinator and routine
//!   maintenance hold it shared, rare exclusive actions (schema-migration
//!   style) take it exclusively and block both.
//!
//! This registry models the durable advisory lock for the in-process stack;
//! multi-replica deployments route through the relational backend's
//! pg advisory helpers instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

#[derive(Default)]
struct TenantLockState {
    coordinator: Arc<AsyncMutex<()>>,
    phase: Arc<RwLock<()>>,
}

impl TenantLockState {
    fn new() -> Self {
        Self {
            coordinator: Arc::new(AsyncMutex::new(())),
            phase: Arc::new(RwLock::new(())),
        }
    }
}

#[derive(Default)]
pub struct TenantLocks {
    tenants: Mutex<HashMap<String, TenantLockState>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, tenant_id: &str) -> (Arc<AsyncMutex<()>>, Arc<RwLock<()>>) {
        let mut tenants = match self.tenants.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let st = tenants
            .entry(tenant_id.to_string())
            .or_insert_with(TenantLockState::new);
        (Arc::clone(&st.coordinator), Arc::clone(&st.phase))
    }

    /// Try to become the tenant's active coordinator. `None` means another
    /// coordinator holds the singleton; retry with jitter.
    pub fn try_coordinator(&self, tenant_id: &str) -> Option<OwnedMutexGuard<()>> {
        let (coordinator, _) = self.state(tenant_id);
        coordinator.try_lock_owned().ok()
    }

    /// Shared phase: coordinator forward progress and routine maintenance.
    pub async fn shared(&self, tenant_id: &str) -> OwnedRwLockReadGuard<()> {
        let (_, phase) = self.state(tenant_id);
        phase.read_owned().await
    }

    /// Exclusive phase: blocks the coordinator and all shared maintenance.
    pub async fn exclusive(&self, tenant_id: &str) -> OwnedRwLockWriteGuard<()> {
        let (_, phase) = self.state(tenant_id);
        phase.write_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn coordinator_singleton_excludes_second_claimer() {
        let locks = TenantLocks::new();
        let first = locks.try_coordinator("t1");
        assert!(first.is_some());
        assert!(locks.try_coordinator("t1").is_none());
        drop(first);
        assert!(locks.try_coordinator("t1").is_some());
    }

    #[tokio::test]
    async fn shared_phase_coexists_but_exclusive_blocks() {
        let locks = TenantLocks::new();
        let a = locks.shared("t1").await;
        let b = locks.shared("t1").await;
        drop(a);

        // Exclusive must wait for the remaining shared holder.
        let exclusive = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            locks.exclusive("t1"),
        )
        .await;
        assert!(exclusive.is_err(), "exclusive must block under shared");

        drop(b);
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            locks.exclusive("t1"),
        )
        .await
        .expect("exclusive proceeds once shared holders drop");
    }

    #[tokio::test]
    async fn tenants_do_not_interfere() {
        let locks = TenantLocks::new();
        let _a = locks.try_coordinator("t1");
        assert!(locks.try_coordinator("t2").is_some());
    }
}
