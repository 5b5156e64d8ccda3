//! # Session Keeper Core
//!
//! Core traits and types shared by every Session Keeper crate.
//!
//! This crate provides the leaf abstractions the token store is built on:
//!
//! - **Token**: Opaque bearer credential with a redacted `Debug` impl
//! - **`StorageMode`**: Which backend currently holds the token
//! - **`StorageBackend`**: Single-key get/set/delete over a key-value medium
//! - **`ChangeFeed`**: Signal for changes made to a backend by other contexts
//! - **Clock**: Injected wall-clock time for lease ageing
//!
//! ## Architecture
//!
//! ```text
//! SessionController ──► AtomicTokenStore ──► LeaseMutex
//!                               │                 │
//!                               ▼                 ▼
//!                    StorageBackend (Durable, Ephemeral)
//! ```
//!
//! Everything above `StorageBackend` lives in the `session-keeper` crate.
//! Test doubles for the traits here live in `session-keeper-testing`.

pub mod backend;
pub mod change;
pub mod token;

pub use backend::{BackendError, BackendKind, StorageBackend};
pub use change::{ChangeFeed, ChangeSignal, OriginId, StorageChange};
pub use token::{StorageMode, Token};

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Environment module - injected dependencies.
///
/// Time is the only ambient dependency the store needs; it is injected so
/// that lease ageing can be tested without sleeping.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait for getting the current wall-clock time.
    ///
    /// Lease timestamps are compared across processes, so they use wall
    /// time rather than a monotonic instant.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
