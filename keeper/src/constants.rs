//! Session keeper constants.
//!
//! Storage keys and default timings shared by the store, the mutex and the
//! controller.

use std::time::Duration;

/// Well-known storage keys.
pub mod keys {
    /// Key holding the bearer token, in both backends.
    pub const TOKEN: &str = "auth_token";

    /// Key holding the mutex lease, in the durable backend only.
    pub const MUTEX: &str = "auth_token_mutex";
}

/// Separator between holder id and timestamp in a serialized lease.
///
/// Format: `{holder_id}:{unix_millis}`.
pub const LEASE_SEPARATOR: char = ':';

/// Age after which a lease is considered abandoned and may be seized.
pub const MUTEX_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a store operation waits for the lease before failing.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between lease polls while another holder owns it.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Inactivity timeout for production sessions.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Inactivity timeout for short-cycle test sessions.
pub const TEST_SESSION_TIMEOUT: Duration = Duration::from_millis(300);
