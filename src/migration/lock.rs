//! Distributed per-tenant migration lock: a single set-if-not-exists key
//! per tenant with a TTL, released explicitly or left to expire. Backed by
//! `Cache`, so the in-process `InMemoryCache` transparently covers the case
//! where no shared cache backend is configured.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::{ClusterError, Result};

const DEFAULT_LOCK_TTL_SECS: u64 = 3600;

pub struct MigrationLock {
    cache: Arc<dyn Cache>,
}

/// Held while a migration lock is acquired. Dropping this without calling
/// `release` leaves the lock to expire on its own TTL rather than panicking
/// in a destructor — callers are expected to release explicitly in the
/// success and error paths alike.
pub struct LockGuard {
    key: String,
}

impl MigrationLock {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    fn key(tenant_id: &str) -> String {
        format!("migration_lock:{tenant_id}")
    }

    /// Acquires the lock for `tenant_id`, holding it for `ttl` (defaults to
    /// one hour). Fails with `LockBusy` if another migration already holds it.
    pub async fn acquire(&self, tenant_id: &str, ttl: Option<Duration>) -> Result<LockGuard> {
        let key = Self::key(tenant_id);
        let ttl = ttl.unwrap_or(Duration::from_secs(DEFAULT_LOCK_TTL_SECS));
        let holder = crate::util::new_id();
        let acquired = self.cache.set_nx(&key, &holder, ttl).await?;
        if !acquired {
            return Err(ClusterError::LockBusy(tenant_id.to_string()));
        }
        Ok(LockGuard { key })
    }

    pub async fn release(&self, guard: LockGuard) -> Result<()> {
        self.cache.delete(&guard.key).await
    }

    pub async fn is_locked(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.cache.get(&Self::key(tenant_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[tokio::test]
    async fn second_acquire_fails_while_first_is_held() {
        let lock = MigrationLock::new(Arc::new(InMemoryCache::new()));
        let guard = lock.acquire("tenant-a", None).await.unwrap();
        let err = lock.acquire("tenant-a", None).await.unwrap_err();
        assert!(matches!(err, ClusterError::LockBusy(_)));
        lock.release(guard).await.unwrap();
        assert!(lock.acquire("tenant-a", None).await.is_ok());
    }

    #[tokio::test]
    async fn different_tenants_do_not_contend() {
        let lock = MigrationLock::new(Arc::new(InMemoryCache::new()));
        let _a = lock.acquire("tenant-a", None).await.unwrap();
        assert!(lock.acquire("tenant-b", None).await.is_ok());
    }

    #[tokio::test]
    async fn release_unlocks_immediately() {
        let lock = MigrationLock::new(Arc::new(InMemoryCache::new()));
        let guard = lock.acquire("tenant-a", Some(Duration::from_secs(60))).await.unwrap();
        assert!(lock.is_locked("tenant-a").await.unwrap());
        lock.release(guard).await.unwrap();
        assert!(!lock.is_locked("tenant-a").await.unwrap());
    }
}
