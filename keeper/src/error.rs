//! Error types for the token store and session controller.

use session_keeper_core::BackendError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for token store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure to obtain the cross-context lease.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcquireError {
    /// Another holder kept the lease for the whole wait budget.
    #[error("Timed out after {waited:?} waiting for the token lease")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The durable backend failed while reading or writing the lease.
    #[error("Lease storage error: {0}")]
    Backend(#[from] BackendError),
}

/// Failures of atomic token store operations.
///
/// The UI layer is expected to treat [`StoreError::Unavailable`] as "try
/// again" and [`StoreError::VerificationFailed`] as "log in again".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The lease could not be obtained in time.
    #[error("Token storage is busy, try again")]
    Unavailable,

    /// The post-write re-read did not match what was written.
    ///
    /// The lease has been released, but the operation must be treated as
    /// not safely completed.
    #[error("Token storage verification failed: {reason}")]
    VerificationFailed {
        /// What the re-read found
        reason: String,
    },

    /// A backend failed during the critical section.
    #[error("Token storage error: {0}")]
    Backend(#[from] BackendError),
}

impl StoreError {
    /// Returns `true` if retrying the same operation may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use session_keeper::StoreError;
    /// assert!(StoreError::Unavailable.is_retryable());
    /// assert!(!StoreError::VerificationFailed { reason: "x".into() }.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Returns `true` if the caller should force a fresh login.
    #[must_use]
    pub const fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::VerificationFailed { .. })
    }
}

impl From<AcquireError> for StoreError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Timeout { .. } => Self::Unavailable,
            AcquireError::Backend(e) => Self::Backend(e),
        }
    }
}

/// Failures surfaced by the session controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The underlying token store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation needs an active session.
    #[error("No active session")]
    NotActive,
}

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },

    /// Configuration values are inconsistent.
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}
