//! In-memory identity store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{IdentityStore, RegistrationRequest};
use crate::error::StoreError;

/// A stored registration.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub user: RegistrationRequest,
    pub created_at: DateTime<Utc>,
}

/// Identity store backed by a vector of rows.
///
/// Like the relational table it stands in for, it does not reject duplicate
/// openids. Every `create` call is recorded so tests can count them.
/// An optional per-call latency simulates network round trips and widens the
/// window between `exists` and `create`.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    rows: Mutex<Vec<UserRecord>>,
    next_id: AtomicI64,
    latency: Duration,
}

impl MemoryIdentityStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before touching the rows.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Number of `create` calls that reached the store for `openid`.
    pub async fn create_calls(&self, openid: &str) -> usize {
        self.rows
            .lock()
            .await
            .iter()
            .filter(|r| r.user.openid == openid)
            .count()
    }

    /// Total number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// Snapshot of all rows.
    pub async fn records(&self) -> Vec<UserRecord> {
        self.rows.lock().await.clone()
    }

    async fn simulate_round_trip(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, openid: &str) -> Result<bool, StoreError> {
        self.simulate_round_trip().await;
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .any(|r| r.user.openid == openid))
    }

    async fn create(&self, user: &RegistrationRequest) -> Result<i64, StoreError> {
        self.simulate_round_trip().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.lock().await.push(UserRecord {
            id,
            user: user.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }
}
