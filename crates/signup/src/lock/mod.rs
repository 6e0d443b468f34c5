//! Per-identity mutual exclusion.
//!
//! A [`Guard`] hands out a [`Held`] value on acquisition; the holder proves
//! ownership by passing it back through [`Held::release`]. Implementations:
//!
//! - [`NoGuard`]: no exclusion at all
//! - [`LocalLockTable`]: one async mutex per identity, this process only
//! - [`DistributedLock`]: TTL lease in a shared coordination store
//! - [`LayeredGuard`]: local table first, then the distributed lease

mod layered;
mod lease;
mod local;
mod memory_store;
mod redis_store;

pub use layered::LayeredGuard;
pub use lease::{lock_key, DistributedLock, FencingToken, Lease, LeaseStore, LOCK_PREFIX};
pub use local::{LocalGuard, LocalLockTable};
pub use memory_store::MemoryLeaseStore;
pub use redis_store::RedisLeaseStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

/// A mutual-exclusion strategy keyed by identity.
#[async_trait]
pub trait Guard: Send + Sync {
    /// Strategy name for logs and stats.
    fn name(&self) -> &'static str;

    /// Acquire exclusion for `identity`, waiting at most `wait`.
    ///
    /// Returns [`LockError::Unavailable`] when the wait elapses.
    async fn acquire(&self, identity: &str, wait: Duration) -> Result<Box<dyn Held>, LockError>;
}

/// An acquired guard. Must be released exactly once.
#[async_trait]
pub trait Held: Send {
    /// Key the guard protects.
    fn key(&self) -> &str;

    async fn release(self: Box<Self>) -> Result<(), LockError>;
}

/// Strategy that never excludes anyone.
///
/// Concurrent check-then-create sequences interleave freely, which is
/// exactly how duplicate registrations happen.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGuard;

struct Unguarded {
    key: String,
}

#[async_trait]
impl Guard for NoGuard {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn acquire(&self, identity: &str, _wait: Duration) -> Result<Box<dyn Held>, LockError> {
        Ok(Box::new(Unguarded {
            key: identity.to_string(),
        }))
    }
}

#[async_trait]
impl Held for Unguarded {
    fn key(&self) -> &str {
        &self.key
    }

    async fn release(self: Box<Self>) -> Result<(), LockError> {
        Ok(())
    }
}
