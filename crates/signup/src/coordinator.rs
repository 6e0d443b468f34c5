//! Registration coordinator.
//!
//! `register` runs acquire guard, check existence, create if absent, release
//! guard as one unit per openid. The identity store offers no atomicity
//! between the check and the create, so two unguarded attempts can both see
//! "absent" and both create; holding the guard across both calls is what
//! makes creation at-most-once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LockError, RegistrationError};
use crate::identity::{IdentityStore, RegistrationRequest};
use crate::lock::{Guard, Held};

/// Default bound on guard acquisition.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Terminal result of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOutcome {
    /// This attempt created the record.
    Registered { id: i64 },
    /// The openid was already present.
    AlreadyRegistered,
    /// The guard could not be obtained in time. The store was not touched.
    Unavailable,
}

impl RegistrationOutcome {
    /// Name used on the wire.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Registered { .. } => "Registered",
            Self::AlreadyRegistered => "AlreadyRegistered",
            Self::Unavailable => "RegistrationUnavailable",
        }
    }

    /// Response code: 0 registered, -1 already registered, -2 unavailable.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Registered { .. } => 0,
            Self::AlreadyRegistered => -1,
            Self::Unavailable => -2,
        }
    }

    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered { .. })
    }
}

/// Outcome counters.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    registered: AtomicU64,
    already_registered: AtomicU64,
    unavailable: AtomicU64,
    failed: AtomicU64,
    release_failures: AtomicU64,
}

/// Point-in-time copy of [`CoordinatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub registered: u64,
    pub already_registered: u64,
    pub unavailable: u64,
    pub failed: u64,
    pub release_failures: u64,
}

impl CoordinatorStats {
    fn record(&self, result: &Result<RegistrationOutcome, RegistrationError>) {
        let counter = match result {
            Ok(RegistrationOutcome::Registered { .. }) => &self.registered,
            Ok(RegistrationOutcome::AlreadyRegistered) => &self.already_registered,
            Ok(RegistrationOutcome::Unavailable) => &self.unavailable,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            registered: self.registered.load(Ordering::Relaxed),
            already_registered: self.already_registered.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializes check-then-create per openid behind a [`Guard`].
pub struct Coordinator {
    store: Arc<dyn IdentityStore>,
    guard: Arc<dyn Guard>,
    acquire_timeout: Duration,
    stats: CoordinatorStats,
}

impl Coordinator {
    #[must_use]
    pub fn new(store: Arc<dyn IdentityStore>, guard: Arc<dyn Guard>) -> Self {
        Self {
            store,
            guard,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            stats: CoordinatorStats::default(),
        }
    }

    #[must_use]
    pub fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    #[must_use]
    pub fn guard_name(&self) -> &'static str {
        self.guard.name()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Register `request.openid` at most once.
    ///
    /// Every path that acquires the guard releases it exactly once. A release
    /// failure after the outcome is known is logged and counted but does not
    /// replace the outcome: the store has already been written.
    #[instrument(skip_all, fields(openid = %request.openid, guard = self.guard.name()))]
    pub async fn register(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let held = match self
            .guard
            .acquire(&request.openid, self.acquire_timeout)
            .await
        {
            Ok(held) => held,
            Err(LockError::Unavailable { key }) => {
                debug!(key = %key, "Guard unavailable within timeout");
                let result = Ok(RegistrationOutcome::Unavailable);
                self.stats.record(&result);
                return result;
            }
            Err(e) => {
                warn!(error = %e, "Guard acquisition failed");
                let result = Err(e.into());
                self.stats.record(&result);
                return result;
            }
        };
        let key = held.key().to_string();
        debug!(key = %key, "Guard acquired");

        let result = self.check_and_create(request).await;

        if let Err(release_err) = held.release().await {
            self.stats.release_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                key = %key,
                error = %release_err,
                outcome = ?result,
                "Guard release failed"
            );
        } else {
            debug!(key = %key, "Guard released");
        }

        match &result {
            Ok(outcome) => info!(outcome = outcome.label(), "Registration finished"),
            Err(e) => warn!(error = %e, "Registration failed"),
        }
        self.stats.record(&result);
        result
    }

    async fn check_and_create(
        &self,
        request: &RegistrationRequest,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        if self.store.exists(&request.openid).await? {
            return Ok(RegistrationOutcome::AlreadyRegistered);
        }
        let id = self.store.create(request).await?;
        Ok(RegistrationOutcome::Registered { id })
    }
}
