//! Distributed lock service
//!
//! Short-lived mutual-exclusion leases over Redis `SET NX PX`, used to
//! serialize read-modify-write quota operations across processes. The lease
//! is a latency/throughput optimization: quota correctness is carried by the
//! atomic conditional update in the ledger, not by the lease alone.
//!
//! When the Redis backend is unreachable, `acquire` returns `true`
//! (fail-open): quota operations stay available at the cost of the
//! mutual-exclusion guarantee in that degraded window.
//!
//! An in-memory backend exists for development and tests, mirroring the
//! Redis semantics including lease expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory lease table (for development without Redis)
pub struct InMemoryLocks {
    /// Store: key -> lease deadline
    leases: tokio::sync::Mutex<HashMap<String, Instant>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self {
            leases: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some(deadline) if *deadline > now => false,
            _ => {
                leases.insert(key.to_string(), now + ttl);
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        self.leases.lock().await.remove(key);
    }

    /// Drop expired leases (call periodically)
    pub async fn cleanup(&self) {
        let now = Instant::now();
        self.leases.lock().await.retain(|_, deadline| *deadline > now);
    }
}

impl Default for InMemoryLocks {
    fn default() -> Self {
        Self::new()
    }
}

enum LockBackend {
    Redis(redis::aio::ConnectionManager),
    Memory(Arc<InMemoryLocks>),
}

/// Lease settings
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Lease TTL in milliseconds
    pub ttl_ms: u64,
    /// Attempts before giving up on a contended lease
    pub acquire_attempts: u32,
    /// Spacing between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: 5_000,
            acquire_attempts: 3,
            retry_delay_ms: 50,
        }
    }
}

/// Distributed lock service
#[derive(Clone)]
pub struct LockService {
    backend: Arc<LockBackend>,
    settings: LockSettings,
}

impl LockService {
    /// Connect to Redis; falls back to the in-memory backend when the
    /// connection cannot be established at startup.
    pub async fn connect(redis_url: &str, settings: LockSettings) -> Self {
        match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(manager) => {
                    tracing::info!("Lock service connected to Redis");
                    Self {
                        backend: Arc::new(LockBackend::Redis(manager)),
                        settings,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Redis unreachable at startup, lock service running in-memory"
                    );
                    Self::new_in_memory(settings)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Invalid Redis URL, lock service running in-memory");
                Self::new_in_memory(settings)
            }
        }
    }

    /// Create a lock service with the in-memory backend
    pub fn new_in_memory(settings: LockSettings) -> Self {
        Self {
            backend: Arc::new(LockBackend::Memory(Arc::new(InMemoryLocks::new()))),
            settings,
        }
    }

    /// Try once to take the lease for `key`.
    ///
    /// Returns `false` when the lease is held by someone else. Returns
    /// `true` when acquired, and also when the Redis backend errors
    /// (fail-open).
    pub async fn acquire(&self, key: &str) -> bool {
        match &*self.backend {
            LockBackend::Memory(locks) => {
                locks
                    .try_acquire(key, Duration::from_millis(self.settings.ttl_ms))
                    .await
            }
            LockBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
                    .arg(key)
                    .arg(1)
                    .arg("NX")
                    .arg("PX")
                    .arg(self.settings.ttl_ms)
                    .query_async(&mut conn)
                    .await;
                match result {
                    Ok(Some(_)) => true,
                    Ok(None) => false,
                    Err(e) => {
                        // Fail-open: availability over strict mutual exclusion.
                        tracing::warn!(
                            key = %key,
                            error = %e,
                            "Lock backend unreachable, proceeding without lease"
                        );
                        true
                    }
                }
            }
        }
    }

    /// Take the lease for `key`, retrying a bounded number of times.
    ///
    /// Returns `false` when the lease stayed contended through every
    /// attempt; callers translate that into a retryable busy signal.
    pub async fn acquire_with_retry(&self, key: &str) -> bool {
        for attempt in 0..self.settings.acquire_attempts {
            if self.acquire(key).await {
                return true;
            }
            if attempt + 1 < self.settings.acquire_attempts {
                tokio::time::sleep(Duration::from_millis(self.settings.retry_delay_ms)).await;
            }
        }
        false
    }

    /// Release the lease for `key` (best-effort)
    pub async fn release(&self, key: &str) {
        match &*self.backend {
            LockBackend::Memory(locks) => locks.release(key).await,
            LockBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let result: redis::RedisResult<i64> =
                    redis::cmd("DEL").arg(key).query_async(&mut conn).await;
                if let Err(e) = result {
                    // The lease TTL bounds the damage of a failed release.
                    tracing::warn!(key = %key, error = %e, "Failed to release lease");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> LockSettings {
        LockSettings {
            ttl_ms: 100,
            acquire_attempts: 2,
            retry_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_acquire_then_contend() {
        let locks = LockService::new_in_memory(fast_settings());
        assert!(locks.acquire("quota:u1:scan").await);
        assert!(!locks.acquire("quota:u1:scan").await);
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let locks = LockService::new_in_memory(fast_settings());
        assert!(locks.acquire("quota:u1:scan").await);
        locks.release("quota:u1:scan").await;
        assert!(locks.acquire("quota:u1:scan").await);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = LockService::new_in_memory(fast_settings());
        assert!(locks.acquire("quota:u1:scan").await);
        assert!(locks.acquire("quota:u1:export").await);
        assert!(locks.acquire("quota:u2:scan").await);
    }

    #[tokio::test]
    async fn test_lease_expires_after_ttl() {
        let locks = LockService::new_in_memory(LockSettings {
            ttl_ms: 20,
            ..fast_settings()
        });
        assert!(locks.acquire("quota:u1:scan").await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(locks.acquire("quota:u1:scan").await);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_gives_up_when_contended() {
        let locks = LockService::new_in_memory(fast_settings());
        assert!(locks.acquire("quota:u1:scan").await);
        assert!(!locks.acquire_with_retry("quota:u1:scan").await);
    }

    #[tokio::test]
    async fn test_in_memory_cleanup_drops_expired() {
        let inner = InMemoryLocks::new();
        assert!(inner.try_acquire("k", Duration::from_millis(5)).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        inner.cleanup().await;
        assert!(inner.leases.lock().await.is_empty());
    }
}
