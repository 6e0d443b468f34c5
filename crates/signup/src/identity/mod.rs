//! Identity store adapter.
//!
//! The store answers two questions, "does this openid exist?" and "create
//! this openid", with no atomicity between them. Callers that need
//! at-most-once creation must hold a guard around both calls; see
//! [`crate::coordinator`].

mod memory;
mod postgres;

pub use memory::{MemoryIdentityStore, UserRecord};
pub use postgres::PgIdentityStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Registration request body.
///
/// `openid` is the identity key; the remaining fields are carried through
/// to the store untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub openid: String,
    pub username: String,
    pub password: String,
}

impl RegistrationRequest {
    #[must_use]
    pub fn new(
        openid: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            openid: openid.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Backing store for registered identities.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Whether a record with this openid exists.
    async fn exists(&self, openid: &str) -> Result<bool, StoreError>;

    /// Insert a new record and return its id.
    async fn create(&self, user: &RegistrationRequest) -> Result<i64, StoreError>;
}
