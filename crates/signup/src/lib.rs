//! Race-free user registration.
//!
//! Duplicate registration requests for one openid can arrive at the same
//! time, on one process or many. Checking for an existing record and then
//! inserting is two independent store calls, so unguarded duplicates can
//! both pass the check and both insert. This crate runs that sequence under
//! a per-openid guard:
//!
//! - [`lock::LocalLockTable`] serializes attempts inside one process
//! - [`lock::DistributedLock`] serializes attempts across processes with a
//!   TTL lease in a shared store (Redis)
//! - [`coordinator::Coordinator`] wraps check-then-create in either guard
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use signup::coordinator::Coordinator;
//! use signup::identity::{MemoryIdentityStore, RegistrationRequest};
//! use signup::lock::LocalLockTable;
//!
//! # async fn example() -> Result<(), signup::error::RegistrationError> {
//! let coordinator = Coordinator::new(
//!     Arc::new(MemoryIdentityStore::new()),
//!     Arc::new(LocalLockTable::new()),
//! );
//! let outcome = coordinator
//!     .register(&RegistrationRequest::new("openid-1", "alice", "secret"))
//!     .await?;
//! assert!(outcome.is_registered());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod harness;
pub mod identity;
pub mod lock;
pub mod server;

pub use config::Config;
pub use coordinator::{Coordinator, RegistrationOutcome};
pub use error::{ConfigError, LockError, RegistrationError, StoreError};
pub use identity::{IdentityStore, RegistrationRequest};
