//! Per-tenant visibility watermark registry.
//!
//! The watermark is the largest visibility token whose effects are durably
//! materialized and visible to queries. One watch channel per tenant gives
//! broadcast-on-publish: every waiter parked on `wait` re-checks after each
//! publish and is released in a single wake.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use mesh_schemas::VisibilityToken;

/// Result of a bounded watermark wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Watermark observed when the wait ended.
    pub reached: VisibilityToken,
    pub timed_out: bool,
}

#[derive(Default)]
pub struct WatermarkRegistry {
    tenants: Mutex<HashMap<String, watch::Sender<VisibilityToken>>>,
}

impl WatermarkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, tenant_id: &str) -> watch::Sender<VisibilityToken> {
        let mut tenants = match self.tenants.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .clone()
    }

    /// CAS the stored value upward and wake all waiters. A stale token (a
    /// publish from a retried path) is logged and skipped, never a
    /// regression.
    pub fn publish(&self, tenant_id: &str, token: VisibilityToken) {
        let tx = self.sender(tenant_id);
        let mut stale = None;
        tx.send_if_modified(|current| {
            if token > *current {
                *current = token;
                true
            } else {
                stale = Some(*current);
                false
            }
        });
        if let Some(current) = stale {
            warn!(tenant_id, token, current, "stale watermark publish skipped");
        }
    }

    pub fn current(&self, tenant_id: &str) -> VisibilityToken {
        *self.sender(tenant_id).borrow()
    }

    /// Seed from the event store's max committed token at coordinator
    /// attach. Same monotonic rule as `publish`.
    pub fn rehydrate(&self, tenant_id: &str, token: VisibilityToken) {
        self.publish(tenant_id, token);
    }

    /// Block until `current(tenant) >= min_token` or the timeout lapses.
    /// Cancellation is delivered by dropping the returned future; no state
    /// is held across the wait beyond the channel subscription.
    pub async fn wait(
        &self,
        tenant_id: &str,
        min_token: VisibilityToken,
        timeout: Duration,
    ) -> WaitOutcome {
        let mut rx = self.sender(tenant_id).subscribe();
        {
            let current = *rx.borrow_and_update();
            if current >= min_token {
                return WaitOutcome {
                    reached: current,
                    timed_out: false,
                };
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let changed = tokio::time::timeout_at(deadline, rx.changed()).await;
            match changed {
                Ok(Ok(())) => {
                    let current = *rx.borrow_and_update();
                    if current >= min_token {
                        return WaitOutcome {
                            reached: current,
                            timed_out: false,
                        };
                    }
                }
                // Sender dropped: registry is shutting down; report what we
                // saw so the caller can fail with the observed watermark.
                Ok(Err(_)) => {
                    return WaitOutcome {
                        reached: *rx.borrow(),
                        timed_out: true,
                    };
                }
                Err(_) => {
                    return WaitOutcome {
                        reached: *rx.borrow(),
                        timed_out: true,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn publish_is_monotonic() {
        let reg = WatermarkRegistry::new();
        reg.publish("t1", 5);
        reg.publish("t1", 3);
        assert_eq!(reg.current("t1"), 5);
        reg.publish("t1", 9);
        assert_eq!(reg.current("t1"), 9);
    }

    #[tokio::test]
    async fn wait_releases_on_publish() {
        let reg = Arc::new(WatermarkRegistry::new());
        let waiter = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move { reg.wait("t1", 4, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        reg.publish("t1", 4);
        let out = waiter.await.unwrap();
        assert!(!out.timed_out);
        assert_eq!(out.reached, 4);
    }

    #[tokio::test]
    async fn wait_times_out_with_observed_watermark() {
        let reg = WatermarkRegistry::new();
        reg.publish("t1", 2);
        let out = reg.wait("t1", 10, Duration::from_millis(50)).await;
        assert!(out.timed_out);
        assert_eq!(out.reached, 2);
    }

    #[tokio::test]
    async fn broadcast_releases_multiple_waiters() {
        let reg = Arc::new(WatermarkRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.wait("t1", 3, Duration::from_secs(5)).await
            }));
        }
        tokio::task::yield_now().await;
        reg.publish("t1", 3);
        for h in handles {
            let out = h.await.unwrap();
            assert!(!out.timed_out);
            assert!(out.reached >= 3);
        }
    }

    #[tokio::test]
    async fn tenants_are_independent() {
        let reg = WatermarkRegistry::new();
        reg.publish("t1", 7);
        assert_eq!(reg.current("t2"), 0);
    }
}
