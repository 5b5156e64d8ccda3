//! Session authority trait.

use serde::{Deserialize, Serialize};
use session_keeper_core::Token;
use thiserror::Error;

/// Identity behind a validated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOwner {
    /// Stable user identifier.
    pub user_id: String,
    /// Name suitable for display, if the server provides one.
    pub display_name: Option<String>,
}

impl SessionOwner {
    /// Create an owner with no display name.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Failures reported by the session authority.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorityError {
    /// The server rejected the token (expired, revoked, unknown).
    #[error("Session rejected: {0}")]
    Rejected(String),

    /// The server could not be reached.
    #[error("Session authority unreachable: {0}")]
    Unreachable(String),
}

/// Server-side authority for session tokens.
///
/// # Implementation Notes
///
/// - Both calls may be slow; the controller never holds the token lease
///   while awaiting them
/// - `invalidate` is best-effort: the controller clears local state even
///   if it fails
pub trait SessionAuthority: Send + Sync + 'static {
    /// Validate `token` and fetch the user it belongs to.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The token is invalid or expired → [`AuthorityError::Rejected`]
    /// - The network request fails → [`AuthorityError::Unreachable`]
    fn validate_and_fetch_session_owner(
        &self,
        token: &Token,
    ) -> impl std::future::Future<Output = Result<SessionOwner, AuthorityError>> + Send;

    /// Invalidate `token` on the server.
    ///
    /// # Errors
    ///
    /// Returns error if the network request fails.
    fn invalidate(
        &self,
        token: &Token,
    ) -> impl std::future::Future<Output = Result<(), AuthorityError>> + Send;
}
