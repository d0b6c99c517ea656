use crate::store::{KvStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Fixed-window rate limiter over the shared store.
///
/// The window starts when the first request after the previous expiry
/// increments the counter and ends when that counter's TTL runs out. The
/// Nth request within a window is the last one admitted. Burst traffic
/// across a window boundary can briefly see close to 2N requests; that is
/// the accepted behavior of this scheme, not something to correct here.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    key: String,
    limit: i64,
    window: Duration,
}

const LOW_REMAINING_THRESHOLD: i64 = 5;

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>, limit: i64, window: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            limit,
            window,
        }
    }

    /// Consume one unit of quota. Returns whether the request may proceed.
    ///
    /// A store failure propagates: callers must treat an unavailable
    /// limiter as a failed fetch, never as permission to bypass it.
    pub async fn try_acquire(&self) -> Result<bool, StoreError> {
        let count = self.store.incr(&self.key).await?;

        // First increment of a fresh window starts its lifetime.
        if count == 1 {
            self.store.expire(&self.key, self.window).await?;
        }

        // Remaining TTL is logged for operators; admission ignores it.
        let reset_in = self.store.ttl(&self.key).await?;
        let allowed = count <= self.limit;

        if !allowed || self.limit - count < LOW_REMAINING_THRESHOLD {
            tracing::warn!(
                remaining = (self.limit - count).max(0),
                reset_in_secs = reset_in,
                "rate limit status"
            );
        }

        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(store: Arc<MemoryStore>, limit: i64, window: Duration) -> RateLimiter {
        RateLimiter::new(store, "coingecko:rate_limit", limit, window)
    }

    #[tokio::test]
    async fn test_admits_exactly_limit_requests() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 30, Duration::from_secs(60));

        for _ in 0..30 {
            assert!(limiter.try_acquire().await.unwrap());
        }
        assert!(!limiter.try_acquire().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_fresh_window_readmits() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store, 2, Duration::from_millis(200));

        assert!(limiter.try_acquire().await.unwrap());
        assert!(limiter.try_acquire().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_shared_through_store() {
        let store = Arc::new(MemoryStore::new());
        let a = limiter(store.clone(), 2, Duration::from_secs(60));
        let b = limiter(store, 2, Duration::from_secs(60));

        assert!(a.try_acquire().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_denied_attempts_extend_nothing() {
        // The window is pinned to the first increment's expiry; denied
        // attempts keep counting but do not push the reset out.
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), 1, Duration::from_millis(200));

        assert!(limiter.try_acquire().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());
        assert!(!limiter.try_acquire().await.unwrap());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(limiter.try_acquire().await.unwrap());
    }
}
