//! Mutex lease records.
//!
//! A lease is stored in the durable backend under [`keys::MUTEX`] as
//! `{holder_id}:{unix_millis}`.
//!
//! [`keys::MUTEX`]: crate::constants::keys::MUTEX

use crate::constants::LEASE_SEPARATOR;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::time::Duration;

/// Identifier of a lease holder.
///
/// A fresh id is generated for every acquisition attempt, so a holder id
/// also identifies the specific critical section holding the lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderId(String);

impl HolderId {
    /// Generate a new random holder id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HolderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Time-bounded ownership record for the token critical section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexLease {
    /// Who holds the lease.
    pub holder_id: HolderId,
    /// When the lease was written.
    pub acquired_at: DateTime<Utc>,
}

impl MutexLease {
    /// Create a lease for `holder_id` acquired at `acquired_at`.
    #[must_use]
    pub const fn new(holder_id: HolderId, acquired_at: DateTime<Utc>) -> Self {
        Self {
            holder_id,
            acquired_at,
        }
    }

    /// Serialize to the stored form.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}{LEASE_SEPARATOR}{}",
            self.holder_id,
            self.acquired_at.timestamp_millis()
        )
    }

    /// Parse the stored form.
    ///
    /// Returns `None` for values that are not `{holder}:{millis}` with a
    /// non-empty holder and a representable timestamp.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (holder, millis) = raw.rsplit_once(LEASE_SEPARATOR)?;
        if holder.is_empty() {
            return None;
        }
        let millis: i64 = millis.parse().ok()?;
        let acquired_at = Utc.timestamp_millis_opt(millis).single()?;
        Some(Self::new(HolderId::from(holder), acquired_at))
    }

    /// Age of the lease at `now`. A lease stamped in the future has age zero.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Returns `true` if the lease is older than `mutex_timeout` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, mutex_timeout: Duration) -> bool {
        self.age(now) > mutex_timeout
    }
}
