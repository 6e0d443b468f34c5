//! In-process lease store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::LeaseStore;
use crate::error::LockError;

#[derive(Debug, Clone)]
struct StoredLease {
    token: String,
    expires_at: Instant,
}

impl StoredLease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Lease store kept in a concurrent map.
///
/// Expiry is checked lazily against the tokio clock, so paused-time tests
/// can step a lease past its TTL with `tokio::time::advance`. Only useful
/// within one process.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    entries: DashMap<String, StoredLease>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live leases.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = Instant::now();
        let lease = StoredLease {
            token: token.to_string(),
            expires_at: now + ttl,
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(lease);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.token.clone()))
    }

    async fn delete_if_owner(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, lease| lease.token == token && lease.is_live(now))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_respects_expiry() {
        let store = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(2);

        assert!(store.set_if_absent("lock:a", "t1", ttl).await.unwrap());
        assert!(!store.set_if_absent("lock:a", "t2", ttl).await.unwrap());
        assert_eq!(store.live_count(), 1);

        tokio::time::advance(ttl).await;
        assert_eq!(store.get("lock:a").await.unwrap(), None);
        assert!(store.set_if_absent("lock:a", "t2", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_delete_if_owner_only_deletes_matching_token() {
        let store = MemoryLeaseStore::new();
        store
            .set_if_absent("lock:a", "t1", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store.delete_if_owner("lock:a", "other").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("t1"));

        assert!(store.delete_if_owner("lock:a", "t1").await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap(), None);
    }
}
