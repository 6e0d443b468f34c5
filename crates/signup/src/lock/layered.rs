//! Local lock table in front of a distributed lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DistributedLock, Guard, Held, Lease, LocalGuard, LocalLockTable};
use crate::error::LockError;

/// Takes the in-process lock for an identity before asking the coordination
/// store for its lease.
///
/// Duplicate requests landing on the same process queue on the local mutex
/// instead of polling the store. The wait budget covers both steps.
#[derive(Debug, Clone)]
pub struct LayeredGuard {
    local: Arc<LocalLockTable>,
    remote: DistributedLock,
}

impl LayeredGuard {
    #[must_use]
    pub fn new(local: Arc<LocalLockTable>, remote: DistributedLock) -> Self {
        Self { local, remote }
    }
}

struct LayeredHeld {
    lease: Lease,
    _local: LocalGuard,
}

#[async_trait]
impl Guard for LayeredGuard {
    fn name(&self) -> &'static str {
        "layered"
    }

    async fn acquire(&self, identity: &str, wait: Duration) -> Result<Box<dyn Held>, LockError> {
        let started = Instant::now();
        let local = self.local.lock(identity, wait).await?;
        let remaining = wait.saturating_sub(started.elapsed());
        let lease = self.remote.acquire_within(identity, remaining).await?;
        Ok(Box::new(LayeredHeld {
            lease,
            _local: local,
        }))
    }
}

#[async_trait]
impl Held for LayeredHeld {
    fn key(&self) -> &str {
        self.lease.key()
    }

    // The local guard drops after the lease is released.
    async fn release(self: Box<Self>) -> Result<(), LockError> {
        let LayeredHeld { lease, _local } = *self;
        Box::new(lease).release().await
    }
}
