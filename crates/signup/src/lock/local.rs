//! Process-local lock table.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Guard, Held};
use crate::error::LockError;

/// Map from identity to an async mutex.
///
/// Entries are created on first use through the map's entry API, so two
/// tasks racing to create the mutex for one identity always end up sharing
/// the same instance. Idle entries are removed by [`Self::sweep_idle`].
#[derive(Debug, Default)]
pub struct LocalLockTable {
    entries: DashMap<String, Arc<Mutex<()>>>,
}

/// Exclusion over one identity inside this process. Dropping it unlocks.
#[derive(Debug)]
pub struct LocalGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl LocalGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl LocalLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, identity: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.entries.get(identity) {
            return Arc::clone(existing.value());
        }
        Arc::clone(self.entries.entry(identity.to_string()).or_default().value())
    }

    /// Lock `identity`, waiting at most `wait`.
    pub async fn lock(&self, identity: &str, wait: Duration) -> Result<LocalGuard, LockError> {
        let mutex = self.mutex_for(identity);
        match tokio::time::timeout(wait, mutex.lock_owned()).await {
            Ok(guard) => Ok(LocalGuard {
                key: identity.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                debug!(openid = %identity, "Timed out waiting for local lock");
                Err(LockError::Unavailable {
                    key: identity.to_string(),
                })
            }
        }
    }

    /// Lock `identity` only if nobody holds it right now.
    pub fn try_lock(&self, identity: &str) -> Result<LocalGuard, LockError> {
        self.mutex_for(identity)
            .try_lock_owned()
            .map(|guard| LocalGuard {
                key: identity.to_string(),
                _guard: guard,
            })
            .map_err(|_| LockError::Unavailable {
                key: identity.to_string(),
            })
    }

    /// Number of identities with a live entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that no task holds or waits on. Returns how many were removed.
    ///
    /// Holders and waiters each own a clone of the entry's `Arc`, and clones
    /// are only taken under the shard lock `retain` also holds, so an entry
    /// with a strong count of one cannot gain a user mid-sweep.
    pub fn sweep_idle(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Swept idle local locks");
        }
        removed
    }

    /// Run [`Self::sweep_idle`] every `period` until the table is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.sweep_idle();
            }
        })
    }
}

#[async_trait]
impl Guard for LocalLockTable {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn acquire(&self, identity: &str, wait: Duration) -> Result<Box<dyn Held>, LockError> {
        Ok(Box::new(self.lock(identity, wait).await?))
    }
}

#[async_trait]
impl Held for LocalGuard {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        drop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_creation_shares_one_mutex() {
        let table = Arc::new(LocalLockTable::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = Arc::clone(&table);
                tokio::spawn(async move { table.mutex_for("u1") })
            })
            .collect();

        let mut mutexes = Vec::new();
        for handle in handles {
            mutexes.push(handle.await.unwrap());
        }

        assert_eq!(table.len(), 1);
        assert!(mutexes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn test_same_identity_is_exclusive() {
        let table = LocalLockTable::new();
        let guard = table.try_lock("u1").unwrap();
        assert_eq!(guard.key(), "u1");

        assert!(matches!(
            table.try_lock("u1"),
            Err(LockError::Unavailable { .. })
        ));
        assert!(table.try_lock("u2").is_ok());

        drop(guard);
        assert!(table.try_lock("u1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_when_held() {
        let table = LocalLockTable::new();
        let _held = table.try_lock("u1").unwrap();

        let start = tokio::time::Instant::now();
        let result = table.lock("u1", Duration::from_millis(200)).await;
        assert!(matches!(result, Err(LockError::Unavailable { .. })));
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let table = Arc::new(LocalLockTable::new());
        let guard = table.try_lock("u1").unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.lock("u1", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(guard);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_sweep_keeps_held_entries() {
        let table = LocalLockTable::new();
        let held = table.try_lock("held").unwrap();
        drop(table.try_lock("idle").unwrap());
        assert_eq!(table.len(), 2);

        assert_eq!(table.sweep_idle(), 1);
        assert_eq!(table.len(), 1);

        // The surviving entry is still the one the holder owns.
        assert!(table.try_lock("held").is_err());
        drop(held);
        assert_eq!(table.sweep_idle(), 1);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_periodically() {
        let table = Arc::new(LocalLockTable::new());
        drop(table.try_lock("u1").unwrap());
        let handle = table.spawn_sweeper(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(table.is_empty());

        drop(table);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(handle.is_finished());
    }
}
