//! Per-user, per-operation migration rate limiter: a counter keyed by user
//! and operation, windowed by a configurable TTL (one hour by default),
//! backed by the same `Cache` abstraction the lock uses.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::{ClusterError, Result};

pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    window: Duration,
    max_per_window: u32,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, window_hours: u64, max_per_window: u32) -> Self {
        Self {
            cache,
            window: Duration::from_secs(window_hours * 3600),
            max_per_window,
        }
    }

    fn key(user_id: &str, operation: &str) -> String {
        format!("migration_rate_limit:{user_id}:{operation}")
    }

    /// Checks and increments the counter for `(user_id, operation)` in one
    /// step. Returns `RateLimited` once `max_per_window` is exceeded within
    /// the current window; the window itself resets via the cache entry's
    /// TTL rather than a sliding clock, matching the source's counter reset.
    pub async fn check_and_increment(&self, user_id: &str, operation: &str) -> Result<()> {
        let key = Self::key(user_id, operation);
        let count = match self.cache.get(&key).await? {
            Some(raw) => raw.parse::<u32>().unwrap_or(0),
            None => 0,
        };
        if count >= self.max_per_window {
            return Err(ClusterError::RateLimited {
                retry_after_secs: self.window.as_secs(),
            });
        }
        self.cache.set(&key, &(count + 1).to_string(), self.window).await
    }

    pub async fn remaining(&self, user_id: &str, operation: &str) -> Result<u32> {
        let count = match self.cache.get(&Self::key(user_id, operation)).await? {
            Some(raw) => raw.parse::<u32>().unwrap_or(0),
            None => 0,
        };
        Ok(self.max_per_window.saturating_sub(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;

    #[tokio::test]
    async fn allows_up_to_the_configured_max_then_rejects() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCache::new()), 1, 2);
        limiter.check_and_increment("u1", "export").await.unwrap();
        limiter.check_and_increment("u1", "export").await.unwrap();
        let err = limiter.check_and_increment("u1", "export").await.unwrap_err();
        assert!(matches!(err, ClusterError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn separate_operations_have_independent_budgets() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCache::new()), 1, 1);
        limiter.check_and_increment("u1", "export").await.unwrap();
        limiter.check_and_increment("u1", "import").await.unwrap();
    }

    #[tokio::test]
    async fn remaining_reflects_consumed_budget() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCache::new()), 1, 3);
        assert_eq!(limiter.remaining("u1", "export").await.unwrap(), 3);
        limiter.check_and_increment("u1", "export").await.unwrap();
        assert_eq!(limiter.remaining("u1", "export").await.unwrap(), 2);
    }
}
