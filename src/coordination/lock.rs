//! Lease-based distributed locks.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::CoordinationError;
use crate::db::Store;

/// Delay between acquisition attempts while waiting on a held lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Atomic compare-and-set-with-TTL store behind the lock service.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Take or renew `key` for `holder`. Fails while another holder's lease is live.
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, CoordinationError>;

    /// Drop `key` if `holder` owns it.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, CoordinationError>;

    async fn is_locked(&self, key: &str) -> Result<bool, CoordinationError>;
}

/// Single-process backend on the tokio clock.
#[derive(Default)]
pub struct MemoryLockBackend {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>, CoordinationError> {
        self.leases
            .lock()
            .map_err(|_| CoordinationError::Backend("lease table mutex poisoned".to_string()))
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, CoordinationError> {
        let now = Instant::now();
        let mut leases = self.leases()?;
        let free = match leases.get(key) {
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
            None => true,
        };
        if free {
            leases.insert(key.to_string(), (holder.to_string(), now + lease));
        }
        Ok(free)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, CoordinationError> {
        let mut leases = self.leases()?;
        match leases.get(key) {
            Some((owner, _)) if owner == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_locked(&self, key: &str) -> Result<bool, CoordinationError> {
        let now = Instant::now();
        Ok(self
            .leases()?
            .get(key)
            .map(|(_, expires_at)| *expires_at > now)
            .unwrap_or(false))
    }
}

/// Cross-process backend on the shared SQLite `leases` table.
pub struct SqliteLockBackend {
    store: Store,
}

impl SqliteLockBackend {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    async fn try_acquire(&self, key: &str, holder: &str, lease: Duration) -> Result<bool, CoordinationError> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(self
            .store
            .try_acquire_lease(key, holder, lease.as_millis() as i64, now_ms)?)
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, CoordinationError> {
        Ok(self.store.release_lease(key, holder)?)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, CoordinationError> {
        let now_ms = Utc::now().timestamp_millis();
        Ok(self.store.lease_holder(key, now_ms)?.is_some())
    }
}

/// Lock operations on behalf of one holder identity.
#[derive(Clone)]
pub struct DistributedLockService {
    backend: Arc<dyn LockBackend>,
    holder_id: String,
}

impl DistributedLockService {
    pub fn new(backend: Arc<dyn LockBackend>, holder_id: &str) -> Self {
        Self {
            backend,
            holder_id: holder_id.to_string(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Try to take `key`, waiting up to `wait` for another holder to let go.
    /// The lock lapses after `lease` unless renewed or released.
    pub async fn try_lock(&self, key: &str, wait: Duration, lease: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            match self.backend.try_acquire(key, &self.holder_id, lease).await {
                Ok(true) => {
                    tracing::debug!(lock_key = key, "Acquired distributed lock");
                    return true;
                }
                Ok(false) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(lock_key = key, "Failed to acquire distributed lock");
                        return false;
                    }
                    tokio::time::sleep(RETRY_INTERVAL.min(deadline - now)).await;
                }
                Err(e) => {
                    tracing::warn!(lock_key = key, error = %e, "Lock backend error while acquiring");
                    return false;
                }
            }
        }
    }

    /// Release `key`. Releasing a lock held by someone else only logs a warning.
    pub async fn unlock(&self, key: &str) {
        match self.backend.release(key, &self.holder_id).await {
            Ok(true) => tracing::debug!(lock_key = key, "Released distributed lock"),
            Ok(false) => tracing::warn!(lock_key = key, "Attempted to unlock a lock not held by this node"),
            Err(e) => tracing::warn!(lock_key = key, error = %e, "Lock backend error while releasing"),
        }
    }

    /// Whether anyone currently holds `key`.
    pub async fn is_locked(&self, key: &str) -> bool {
        match self.backend.is_locked(key).await {
            Ok(locked) => locked,
            Err(e) => {
                tracing::warn!(lock_key = key, error = %e, "Lock backend error while checking lock");
                false
            }
        }
    }

    /// Run `action` while holding `key`. Returns false if the lock was not acquired.
    pub async fn execute_with_lock<F, Fut>(&self, key: &str, wait: Duration, lease: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.try_lock(key, wait, lease).await {
            return false;
        }
        action().await;
        self.unlock(key).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn services(backend: Arc<dyn LockBackend>) -> (DistributedLockService, DistributedLockService) {
        (
            DistributedLockService::new(backend.clone(), "node-a"),
            DistributedLockService::new(backend, "node-b"),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_lock_excludes_and_expires() {
        let (a, b) = services(Arc::new(MemoryLockBackend::new()));
        let lease = Duration::from_secs(30);

        assert!(a.try_lock("job", Duration::ZERO, lease).await);
        assert!(a.is_locked("job").await);
        assert!(!b.try_lock("job", Duration::ZERO, lease).await);
        // Re-acquiring as the holder renews.
        assert!(a.try_lock("job", Duration::ZERO, lease).await);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!a.is_locked("job").await);
        assert!(b.try_lock("job", Duration::ZERO, lease).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_waits_for_release() {
        let backend: Arc<dyn LockBackend> = Arc::new(MemoryLockBackend::new());
        let (a, b) = services(backend);
        assert!(a.try_lock("job", Duration::ZERO, Duration::from_secs(2)).await);

        // The lease lapses while b is still waiting.
        assert!(b.try_lock("job", Duration::from_secs(5), Duration::from_secs(30)).await);
        assert!(!a.try_lock("job", Duration::from_secs(1), Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_unlock_by_non_holder_is_noop() {
        let (a, b) = services(Arc::new(MemoryLockBackend::new()));
        assert!(a.try_lock("job", Duration::ZERO, Duration::from_secs(30)).await);
        b.unlock("job").await;
        assert!(a.is_locked("job").await);
        a.unlock("job").await;
        assert!(!a.is_locked("job").await);
    }

    #[tokio::test]
    async fn test_execute_with_lock() {
        let (a, b) = services(Arc::new(MemoryLockBackend::new()));
        let ran = AtomicBool::new(false);

        assert!(b.try_lock("job", Duration::ZERO, Duration::from_secs(30)).await);
        assert!(!a.execute_with_lock("job", Duration::ZERO, Duration::from_secs(30), || async {
            ran.store(true, Ordering::SeqCst);
        })
        .await);
        assert!(!ran.load(Ordering::SeqCst));

        b.unlock("job").await;
        assert!(a.execute_with_lock("job", Duration::ZERO, Duration::from_secs(30), || async {
            ran.store(true, Ordering::SeqCst);
        })
        .await);
        assert!(ran.load(Ordering::SeqCst));
        assert!(!a.is_locked("job").await);
    }

    #[tokio::test]
    async fn test_sqlite_lock_shared_between_stores() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let a = DistributedLockService::new(Arc::new(SqliteLockBackend::new(Store::new(&path).unwrap())), "node-a");
        let b = DistributedLockService::new(Arc::new(SqliteLockBackend::new(Store::new(&path).unwrap())), "node-b");
        let lease = Duration::from_secs(30);

        assert!(a.try_lock("leader", Duration::ZERO, lease).await);
        assert!(!b.try_lock("leader", Duration::ZERO, lease).await);
        assert!(b.is_locked("leader").await);

        b.unlock("leader").await;
        assert!(a.is_locked("leader").await);
        a.unlock("leader").await;
        assert!(b.try_lock("leader", Duration::ZERO, lease).await);
    }
}
