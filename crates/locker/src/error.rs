//! Error types for the lock system.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while acquiring, signalling or releasing a lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not obtained before the wait timeout elapsed
    #[error("lock unavailable: key {key} not acquired within {waited:?}")]
    Unavailable { key: i64, waited: Duration },

    /// The backing connection could not be established or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// A query against the backing store failed
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The notification payload could not be encoded
    #[error("unable to encode notification payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The session health probe failed
    #[error("session ping failed: {0}")]
    Ping(String),

    /// The notification listener failed
    #[error("notification listener error: {0}")]
    Listener(String),

    /// The lock instance is already held; acquire it once
    #[error("lock {0} is already held by this instance")]
    AlreadyHeld(i64),

    /// The lock was already released and its connection torn down
    #[error("lock {0} has already been released")]
    Released(i64),

    /// A lock option read from the environment could not be parsed
    #[error("invalid {var}: {message}")]
    InvalidOption { var: &'static str, message: String },
}

impl LockError {
    /// Whether the error means the lock is held elsewhere, as opposed to a fault.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
