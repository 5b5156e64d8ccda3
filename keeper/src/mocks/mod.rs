//! Mock implementations for testing.
//!
//! In-memory doubles for the session authority and a fault-injecting
//! backend wrapper, for use in unit and integration tests.

pub mod authority;
pub mod flaky;

pub use authority::MockSessionAuthority;
pub use flaky::FlakyBackend;
