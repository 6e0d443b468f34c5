//! Error types for registration coordination.

use thiserror::Error;

/// Failures raised by a guard (local lock table or distributed lease).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock is held by someone else.
    #[error("lock '{key}' is held by another owner")]
    Unavailable { key: String },

    /// Release found a different (or no) token under the key.
    #[error("lock '{key}' is no longer owned by this holder")]
    OwnershipMismatch { key: String },

    /// Transport-level failure talking to the coordination store.
    #[error("coordination store unreachable: {0}")]
    StoreUnreachable(String),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnreachable(err.to_string())
    }
}

/// Failures raised by the identity store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection or transport failure.
    #[error("identity store unreachable: {0}")]
    Unreachable(String),

    /// The store answered but the statement failed.
    #[error("identity store query failed: {0}")]
    Query(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Query(err.to_string())
        }
    }
}

/// Non-outcome failures of a registration attempt.
///
/// Contention is not an error: it is reported as
/// [`RegistrationOutcome::Unavailable`](crate::coordinator::RegistrationOutcome).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Either store could not be reached.
    #[error("store unreachable: {0}")]
    StoreUnreachable(String),

    /// The identity store answered but rejected the statement.
    #[error("store query failed: {0}")]
    StoreQuery(String),

    /// The lease expired or was taken over while the attempt was running.
    #[error("lock '{key}' ownership lost")]
    LockOwnershipMismatch { key: String },
}

impl From<StoreError> for RegistrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unreachable(reason) => Self::StoreUnreachable(reason),
            StoreError::Query(reason) => Self::StoreQuery(reason),
        }
    }
}

impl From<LockError> for RegistrationError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::OwnershipMismatch { key } => Self::LockOwnershipMismatch { key },
            LockError::StoreUnreachable(reason) => Self::StoreUnreachable(reason),
            LockError::Unavailable { key } => {
                Self::StoreUnreachable(format!("lock '{key}' unavailable"))
            }
        }
    }
}

/// Invalid or missing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration '{key}'")]
    Missing { key: String },

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}
