//! Token and storage mode types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque bearer credential.
///
/// The store never interprets the contents. `Debug` is redacted so that a
/// token cannot end up in log output through `?token` formatting.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Wrap a raw token string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw token value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the raw value.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Which backend currently holds the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    /// Only the durable backend holds the token ("remember me").
    Durable,
    /// The ephemeral backend holds the token.
    ///
    /// Also reported when both backends are populated: the session-scoped
    /// value takes priority on reads.
    Ephemeral,
    /// Neither backend holds a token.
    None,
}

impl StorageMode {
    /// Classify from the presence of a value in each backend.
    ///
    /// # Examples
    ///
    /// ```
    /// # use session_keeper_core::StorageMode;
    /// assert_eq!(StorageMode::classify(true, false), StorageMode::Durable);
    /// assert_eq!(StorageMode::classify(true, true), StorageMode::Ephemeral);
    /// assert_eq!(StorageMode::classify(false, false), StorageMode::None);
    /// ```
    #[must_use]
    pub const fn classify(durable_populated: bool, ephemeral_populated: bool) -> Self {
        match (durable_populated, ephemeral_populated) {
            (_, true) => Self::Ephemeral,
            (true, false) => Self::Durable,
            (false, false) => Self::None,
        }
    }

    /// The mode selected by a "remember me" flag.
    #[must_use]
    pub const fn from_remember(remember: bool) -> Self {
        if remember { Self::Durable } else { Self::Ephemeral }
    }
}
