//! Session keeper configuration.
//!
//! Timings are provided by the application, with environment overrides for
//! deployments and short-cycle test runs.
//!
//! # Environment
//!
//! - `SESSION_KEEPER_PROFILE`: `production` (default) or `test`
//! - `SESSION_KEEPER_TIMEOUT_MS`: session inactivity timeout
//! - `SESSION_KEEPER_MUTEX_TIMEOUT_MS`: age after which a lease is abandoned
//! - `SESSION_KEEPER_OPERATION_TIMEOUT_MS`: lease wait budget per operation
//! - `SESSION_KEEPER_POLL_INTERVAL_MS`: lease poll interval

use crate::constants::{
    DEFAULT_SESSION_TIMEOUT, MUTEX_TIMEOUT, OPERATION_TIMEOUT, POLL_INTERVAL,
    TEST_SESSION_TIMEOUT,
};
use crate::error::ConfigError;
use std::time::Duration;

/// Timing profile selecting the default session timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Long inactivity timeout (minutes).
    Production,
    /// Short inactivity timeout (hundreds of milliseconds).
    Test,
}

impl Profile {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            _ => Err(ConfigError::InvalidValue {
                var: "SESSION_KEEPER_PROFILE".to_string(),
                value: value.to_string(),
            }),
        }
    }

    const fn session_timeout(self) -> Duration {
        match self {
            Self::Production => DEFAULT_SESSION_TIMEOUT,
            Self::Test => TEST_SESSION_TIMEOUT,
        }
    }
}

/// Token store and session controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeeperConfig {
    /// Inactivity timeout applied to restored sessions and used as the
    /// default for new ones.
    ///
    /// Default: 30 minutes
    pub session_timeout: Duration,

    /// Age after which a lease is considered abandoned.
    ///
    /// Default: 5 seconds
    pub mutex_timeout: Duration,

    /// How long an operation waits for the lease.
    ///
    /// Default: 5 seconds
    pub operation_timeout: Duration,

    /// Lease poll interval. Lower values cut hand-off latency at the cost
    /// of more storage reads while contended.
    ///
    /// Default: 10 milliseconds
    pub poll_interval: Duration,
}

impl KeeperConfig {
    /// Create a configuration for the given profile.
    #[must_use]
    pub const fn for_profile(profile: Profile) -> Self {
        Self {
            session_timeout: profile.session_timeout(),
            mutex_timeout: MUTEX_TIMEOUT,
            operation_timeout: OPERATION_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Load configuration from `SESSION_KEEPER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable is malformed or the result is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let profile = match lookup("SESSION_KEEPER_PROFILE") {
            Some(value) => Profile::parse(&value)?,
            None => Profile::Production,
        };

        let mut config = Self::for_profile(profile);

        if let Some(duration) = millis_var(&lookup, "SESSION_KEEPER_TIMEOUT_MS")? {
            config.session_timeout = duration;
        }
        if let Some(duration) = millis_var(&lookup, "SESSION_KEEPER_MUTEX_TIMEOUT_MS")? {
            config.mutex_timeout = duration;
        }
        if let Some(duration) = millis_var(&lookup, "SESSION_KEEPER_OPERATION_TIMEOUT_MS")? {
            config.operation_timeout = duration;
        }
        if let Some(duration) = millis_var(&lookup, "SESSION_KEEPER_POLL_INTERVAL_MS")? {
            config.poll_interval = duration;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the session inactivity timeout.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the stale-lease age.
    #[must_use]
    pub const fn with_mutex_timeout(mut self, timeout: Duration) -> Self {
        self.mutex_timeout = timeout;
        self
    }

    /// Set the lease wait budget.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the lease poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a duration is zero or the poll interval is not
    /// shorter than the operation timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "session_timeout must be > 0".to_string(),
            ));
        }
        if self.mutex_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "mutex_timeout must be > 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "poll_interval must be > 0".to_string(),
            ));
        }
        if self.poll_interval >= self.operation_timeout {
            return Err(ConfigError::Validation(
                "poll_interval must be shorter than operation_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self::for_profile(Profile::Production)
    }
}

fn millis_var<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidValue {
                    var: var.to_string(),
                    value,
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = KeeperConfig::default();
        assert_eq!(config.session_timeout, DEFAULT_SESSION_TIMEOUT);
        assert_eq!(config.mutex_timeout, MUTEX_TIMEOUT);
        assert_eq!(config.operation_timeout, OPERATION_TIMEOUT);
        assert_eq!(config.poll_interval, POLL_INTERVAL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = KeeperConfig::default()
            .with_session_timeout(Duration::from_millis(200))
            .with_mutex_timeout(Duration::from_secs(2))
            .with_operation_timeout(Duration::from_secs(1))
            .with_poll_interval(Duration::from_millis(5));

        assert_eq!(config.session_timeout, Duration::from_millis(200));
        assert_eq!(config.mutex_timeout, Duration::from_secs(2));
        assert_eq!(config.operation_timeout, Duration::from_secs(1));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_test_profile_from_lookup() {
        let config = KeeperConfig::from_lookup(lookup_from(&[("SESSION_KEEPER_PROFILE", "test")]));
        assert_eq!(config, Ok(KeeperConfig::for_profile(Profile::Test)));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let config = KeeperConfig::from_lookup(lookup_from(&[
            ("SESSION_KEEPER_TIMEOUT_MS", "1500"),
            ("SESSION_KEEPER_POLL_INTERVAL_MS", "25"),
        ]))
        .unwrap_or_default();

        assert_eq!(config.session_timeout, Duration::from_millis(1500));
        assert_eq!(config.poll_interval, Duration::from_millis(25));
        assert_eq!(config.mutex_timeout, MUTEX_TIMEOUT);
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let result =
            KeeperConfig::from_lookup(lookup_from(&[("SESSION_KEEPER_TIMEOUT_MS", "soon")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref var, .. }) if var == "SESSION_KEEPER_TIMEOUT_MS"
        ));
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let result = KeeperConfig::from_lookup(lookup_from(&[("SESSION_KEEPER_PROFILE", "staging")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_validation_rejects_slow_poll() {
        let config = KeeperConfig::default()
            .with_operation_timeout(Duration::from_millis(10))
            .with_poll_interval(Duration::from_millis(10));
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let config = KeeperConfig::default().with_session_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
