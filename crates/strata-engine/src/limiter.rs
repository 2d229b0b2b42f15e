use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use strata_core::config::ConcurrencyConfig;
use strata_core::error::{Result, StrataError};

struct RoleSlot {
    semaphore: Arc<Semaphore>,
    limit: usize,
    active: AtomicUsize,
}

/// Bounds the number of concurrently running nodes per role.
///
/// Each role gets a fair (FIFO) semaphore sized to its configured limit,
/// created on first use. Waiters are woken one at a time as permits drop.
pub struct RoleLimiter {
    config: ConcurrencyConfig,
    slots: Mutex<HashMap<String, Arc<RoleSlot>>>,
}

/// Admission for one node of a role. Dropping it releases the slot.
pub struct RolePermit {
    role: String,
    slot: Arc<RoleSlot>,
    _permit: OwnedSemaphorePermit,
}

impl RolePermit {
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Release explicitly. Equivalent to dropping the permit.
    pub fn release(self) {}
}

impl Drop for RolePermit {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::SeqCst);
        debug!(role = %self.role, "Role permit released");
    }
}

impl RoleLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    pub fn limit_for(&self, role: &str) -> usize {
        self.config.limit_for(role)
    }

    /// Wait until `role` has a free slot, then take it.
    pub async fn acquire(&self, role: &str) -> Result<RolePermit> {
        let slot = self.slot(role)?;
        let permit = slot
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StrataError::LimiterClosed(role.to_string()))?;
        Ok(self.admit(role, slot, permit))
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, role: &str) -> Option<RolePermit> {
        let slot = self.slot(role).ok()?;
        let permit = slot.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.admit(role, slot, permit))
    }

    /// Number of permits currently held for `role`.
    pub fn active_count(&self, role: &str) -> usize {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(role).map(|s| s.active.load(Ordering::SeqCst)))
            .unwrap_or(0)
    }

    /// Snapshot of active counts for every role seen so far.
    pub fn active_counts(&self) -> HashMap<String, usize> {
        self.slots
            .lock()
            .map(|slots| {
                slots
                    .iter()
                    .map(|(role, s)| (role.clone(), s.active.load(Ordering::SeqCst)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn admit(&self, role: &str, slot: Arc<RoleSlot>, permit: OwnedSemaphorePermit) -> RolePermit {
        let active = slot.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(role, active, limit = slot.limit, "Role permit acquired");
        RolePermit {
            role: role.to_string(),
            slot,
            _permit: permit,
        }
    }

    fn slot(&self, role: &str) -> Result<Arc<RoleSlot>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StrataError::LimiterClosed(role.to_string()))?;
        let slot = slots.entry(role.to_string()).or_insert_with(|| {
            let limit = self.config.limit_for(role).max(1);
            Arc::new(RoleSlot {
                semaphore: Arc::new(Semaphore::new(limit)),
                limit,
                active: AtomicUsize::new(0),
            })
        });
        Ok(slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter() -> Arc<RoleLimiter> {
        Arc::new(RoleLimiter::new(
            ConcurrencyConfig::new(4).with_role_limit("implementation", 2),
        ))
    }

    #[tokio::test]
    async fn unconfigured_roles_default_to_one() {
        let limiter = limiter();
        assert_eq!(limiter.limit_for("security_audit"), 1);
        let first = limiter.acquire("security_audit").await.unwrap();
        assert!(limiter.try_acquire("security_audit").is_none());
        drop(first);
        assert!(limiter.try_acquire("security_audit").is_some());
    }

    #[tokio::test]
    async fn counts_active_permits() {
        let limiter = limiter();
        let a = limiter.acquire("implementation").await.unwrap();
        let b = limiter.acquire("implementation").await.unwrap();
        assert_eq!(limiter.active_count("implementation"), 2);
        assert!(limiter.try_acquire("implementation").is_none());
        a.release();
        assert_eq!(limiter.active_count("implementation"), 1);
        drop(b);
        assert_eq!(limiter.active_count("implementation"), 0);
        assert_eq!(limiter.active_count("never_seen"), 0);
    }

    #[tokio::test]
    async fn waiter_wakes_after_release() {
        let limiter = limiter();
        let held = limiter.acquire("review").await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                let permit = limiter.acquire("review").await.unwrap();
                limiter.active_count(permit.role())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(limiter.active_count("review"), 1);

        drop(held);
        let seen = waiter.await.unwrap();
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn roles_do_not_block_each_other() {
        let limiter = limiter();
        let _review = limiter.acquire("review").await.unwrap();
        let other = tokio::time::timeout(Duration::from_millis(100), limiter.acquire("testing"))
            .await
            .expect("different role should not wait");
        assert!(other.is_ok());
    }
}
