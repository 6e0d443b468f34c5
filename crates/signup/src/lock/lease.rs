//! Distributed lock client.
//!
//! A lease is a key `lock:<name>` in a shared coordination store whose value
//! is the holder's [`FencingToken`]. Acquisition is a create-if-absent write
//! carrying a TTL, so an abandoned lease expires on its own. Release deletes
//! the key only if it still holds the caller's token; anything else is a
//! [`LockError::OwnershipMismatch`], because deleting another holder's lease
//! would let a third party into the critical section.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Guard, Held};
use crate::error::LockError;

/// Prefix of every lease key.
pub const LOCK_PREFIX: &str = "lock:";

/// Default pause between acquisition attempts on a contended lease.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Store key for the lease named `name`.
#[must_use]
pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

/// Opaque proof of lease ownership, unique per acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FencingToken(String);

impl FencingToken {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FencingToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared key-value store that holds leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Atomically write `token` under `key` with expiry `ttl` if the key is absent.
    /// Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, token: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Current value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    /// Atomically delete `key` if its value equals `token`.
    /// Returns whether the key was deleted.
    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, LockError>;
}

/// Client for TTL leases in a [`LeaseStore`].
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    retry_interval: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("backend", &self.store.backend())
            .field("ttl", &self.ttl)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Single acquisition attempt with an explicit TTL. Never retries.
    pub async fn acquire(&self, lock_name: &str, ttl: Duration) -> Result<FencingToken, LockError> {
        let key = lock_key(lock_name);
        let token = FencingToken::generate();
        if self.store.set_if_absent(&key, token.as_str(), ttl).await? {
            debug!(key = %key, token = %token, ttl_ms = ttl.as_millis(), "Lease acquired");
            Ok(token)
        } else {
            Err(LockError::Unavailable { key })
        }
    }

    /// Release a lease previously returned by [`Self::acquire`].
    pub async fn release(&self, lock_name: &str, token: &FencingToken) -> Result<(), LockError> {
        let key = lock_key(lock_name);
        if self.store.delete_if_owner(&key, token.as_str()).await? {
            debug!(key = %key, token = %token, "Lease released");
            Ok(())
        } else {
            warn!(key = %key, token = %token, "Lease no longer owned at release");
            Err(LockError::OwnershipMismatch { key })
        }
    }

    /// Token currently stored for `lock_name`, if the lease is live.
    pub async fn holder(&self, lock_name: &str) -> Result<Option<FencingToken>, LockError> {
        Ok(self
            .store
            .get(&lock_key(lock_name))
            .await?
            .map(FencingToken::from))
    }

    /// Acquire with the configured TTL, polling a contended lease every
    /// `retry_interval` until `wait` elapses.
    ///
    /// An attempt cut off by the deadline may already have written its lease;
    /// that lease is abandoned and expires after the TTL.
    pub async fn acquire_within(&self, lock_name: &str, wait: Duration) -> Result<Lease, LockError> {
        let attempt = async {
            loop {
                match self.acquire(lock_name, self.ttl).await {
                    Ok(token) => return Ok(token),
                    Err(LockError::Unavailable { .. }) => {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(wait, attempt).await {
            Ok(Ok(token)) => Ok(Lease {
                lock: self.clone(),
                name: lock_name.to_string(),
                key: lock_key(lock_name),
                token,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                debug!(
                    key = %lock_key(lock_name),
                    wait_ms = wait.as_millis(),
                    "Timed out waiting for lease"
                );
                Err(LockError::Unavailable {
                    key: lock_key(lock_name),
                })
            }
        }
    }
}

/// A held lease.
#[derive(Debug)]
pub struct Lease {
    lock: DistributedLock,
    name: String,
    key: String,
    token: FencingToken,
}

impl Lease {
    #[must_use]
    pub fn token(&self) -> &FencingToken {
        &self.token
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Held for Lease {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        self.lock.release(&self.name, &self.token).await
    }
}

#[async_trait]
impl Guard for DistributedLock {
    fn name(&self) -> &'static str {
        "distributed"
    }

    async fn acquire(&self, identity: &str, wait: Duration) -> Result<Box<dyn Held>, LockError> {
        Ok(Box::new(self.acquire_within(identity, wait).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::MemoryLeaseStore;

    fn client(ttl: Duration) -> (DistributedLock, Arc<MemoryLeaseStore>) {
        let store = Arc::new(MemoryLeaseStore::new());
        let lock = DistributedLock::new(store.clone(), ttl);
        (lock, store)
    }

    #[test]
    fn test_lock_key_prefix() {
        assert_eq!(lock_key("u1"), "lock:u1");
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(FencingToken::generate(), FencingToken::generate());
    }

    #[tokio::test]
    async fn test_acquire_writes_token_under_prefixed_key() {
        let (lock, store) = client(Duration::from_secs(5));
        let token = lock.acquire("u1", Duration::from_secs(5)).await.unwrap();

        let stored = store.get("lock:u1").await.unwrap();
        assert_eq!(stored.as_deref(), Some(token.as_str()));
        assert_eq!(lock.holder("u1").await.unwrap(), Some(token));
    }

    #[tokio::test]
    async fn test_second_acquire_is_unavailable() {
        let (lock, _) = client(Duration::from_secs(5));
        lock.acquire("u1", Duration::from_secs(5)).await.unwrap();

        let err = lock.acquire("u1", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(
            err,
            LockError::Unavailable {
                key: "lock:u1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_release_then_reacquire() {
        let (lock, _) = client(Duration::from_secs(5));
        let token = lock.acquire("u1", Duration::from_secs(5)).await.unwrap();
        lock.release("u1", &token).await.unwrap();

        assert!(lock.acquire("u1", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_token_release_fails_and_keeps_new_owner() {
        let (lock, _) = client(Duration::from_secs(5));
        let current = lock.acquire("u1", Duration::from_secs(5)).await.unwrap();
        let stale = FencingToken::generate();

        let err = lock.release("u1", &stale).await.unwrap_err();
        assert_eq!(
            err,
            LockError::OwnershipMismatch {
                key: "lock:u1".to_string()
            }
        );
        assert_eq!(lock.holder("u1").await.unwrap(), Some(current));
    }

    #[tokio::test]
    async fn test_release_of_never_held_lock_fails() {
        let (lock, _) = client(Duration::from_secs(5));
        let err = lock
            .release("u1", &FencingToken::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::OwnershipMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_cannot_be_released_by_old_owner() {
        let (lock, _) = client(Duration::from_secs(1));
        let old = lock.acquire("u1", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let new = lock.acquire("u1", Duration::from_secs(1)).await.unwrap();

        assert!(matches!(
            lock.release("u1", &old).await,
            Err(LockError::OwnershipMismatch { .. })
        ));
        assert_eq!(lock.holder("u1").await.unwrap(), Some(new));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreleased_lease_expires_after_ttl_not_before() {
        let (lock, _) = client(Duration::from_secs(1));
        lock.acquire("u1", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(lock.acquire("u1", Duration::from_secs(1)).await.is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(lock.acquire("u1", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_times_out_on_held_lease() {
        let (lock, _) = client(Duration::from_secs(60));
        lock.acquire("u1", Duration::from_secs(60)).await.unwrap();

        let start = tokio::time::Instant::now();
        let err = lock
            .acquire_within("u1", Duration::from_millis(300))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, LockError::Unavailable { .. }));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_waits_out_expiry() {
        let (lock, _) = client(Duration::from_secs(1));
        lock.acquire("u1", Duration::from_secs(1)).await.unwrap();

        let lease = lock
            .acquire_within("u1", Duration::from_millis(1_500))
            .await
            .unwrap();
        assert_eq!(lease.key(), "lock:u1");
        assert_eq!(lease.name(), "u1");
        Box::new(lease).release().await.unwrap();
    }
}
