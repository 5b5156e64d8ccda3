//! Metric names and descriptions.
//!
//! Counters and histograms are emitted through the `metrics` facade; the
//! application installs whichever recorder/exporter it uses. Call
//! [`describe_metrics`] once after installing a recorder.

use metrics::{describe_counter, describe_histogram};

/// Leases acquired.
pub const LEASE_ACQUIRED: &str = "session_keeper_lease_acquired_total";
/// Acquisitions that gave up after the wait budget.
pub const LEASE_TIMEOUTS: &str = "session_keeper_lease_timeouts_total";
/// Abandoned leases taken over from another holder.
pub const LEASE_SEIZED: &str = "session_keeper_lease_seized_total";
/// Time spent waiting for the lease.
pub const LEASE_WAIT_SECONDS: &str = "session_keeper_lease_wait_seconds";
/// Post-write verification failures.
pub const VERIFICATION_FAILURES: &str = "session_keeper_verification_failures_total";
/// Token reads that bypassed the lease.
pub const DEGRADED_READS: &str = "session_keeper_degraded_reads_total";
/// Sessions ended by the inactivity timer.
pub const SESSIONS_EXPIRED: &str = "session_keeper_sessions_expired_total";

/// Register all metric descriptions with the installed recorder.
pub fn describe_metrics() {
    describe_counter!(LEASE_ACQUIRED, "Total number of token leases acquired");
    describe_counter!(
        LEASE_TIMEOUTS,
        "Total number of lease acquisitions that timed out"
    );
    describe_counter!(
        LEASE_SEIZED,
        "Total number of abandoned leases taken over from another holder"
    );
    describe_histogram!(LEASE_WAIT_SECONDS, "Time spent waiting for the token lease");
    describe_counter!(
        VERIFICATION_FAILURES,
        "Total number of token writes whose verification re-read failed"
    );
    describe_counter!(
        DEGRADED_READS,
        "Total number of token reads served without holding the lease"
    );
    describe_counter!(
        SESSIONS_EXPIRED,
        "Total number of sessions ended by inactivity"
    );
}
