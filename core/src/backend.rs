//! Storage backend trait.
//!
//! A backend is a key-value medium holding at most a handful of keys: the
//! token key in both backends, and the lease key in the durable one.

use crate::change::ChangeFeed;
use std::future::Future;
use thiserror::Error;

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Failures reported by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The medium could not be reached (connection refused, lock poisoned).
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// Reading or writing the medium failed.
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// Stored data could not be encoded or decoded.
    #[error("Storage serialization error: {0}")]
    Serialization(String),

    /// The medium refused the write (quota exceeded, read-only).
    #[error("Storage rejected operation: {0}")]
    Rejected(String),
}

/// Which of the two backends a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Survives process restart.
    Durable,
    /// Scoped to the current session/process lifetime.
    Ephemeral,
}

impl BackendKind {
    /// The other backend.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Durable => Self::Ephemeral,
            Self::Ephemeral => Self::Durable,
        }
    }

    /// Stable label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Durable => "durable",
            Self::Ephemeral => "ephemeral",
        }
    }
}

/// Key-value storage medium.
///
/// # Implementation Notes
///
/// - Operations on a single key must be individually atomic; no
///   multi-key transactions are required (the lease provides those).
/// - `delete` of a missing key is not an error.
/// - Handles are cheap to clone and every clone addresses the same medium
///   from the same context.
pub trait StorageBackend: Clone + Send + Sync + 'static {
    /// Read a key.
    ///
    /// # Errors
    ///
    /// Returns error if the medium cannot be read.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Write a key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns error if the medium cannot be written.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

    /// Remove a key.
    ///
    /// # Errors
    ///
    /// Returns error if the medium cannot be written.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to changes made to this medium by other contexts.
    ///
    /// Returns `None` when the medium has no change signal.
    fn watch(&self) -> Option<ChangeFeed> {
        None
    }
}
