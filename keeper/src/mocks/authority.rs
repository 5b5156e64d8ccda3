//! Mock session authority for testing.

use crate::providers::{AuthorityError, SessionAuthority, SessionOwner};
use session_keeper_core::Token;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn lock_failed() -> AuthorityError {
    AuthorityError::Unreachable("Mutex lock failed".to_string())
}

/// Mock session authority.
///
/// Tokens are valid once [`register`](Self::register)ed and until they are
/// invalidated. Invalidations are recorded for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockSessionAuthority {
    owners: Arc<Mutex<HashMap<String, SessionOwner>>>,
    invalidated: Arc<Mutex<Vec<Token>>>,
    unreachable: Arc<AtomicBool>,
    invalidate_delay: Arc<Mutex<Duration>>,
}

impl MockSessionAuthority {
    /// Create an authority that knows no tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as belonging to `owner`.
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn register(&self, token: &Token, owner: SessionOwner) -> Result<(), AuthorityError> {
        self.owners
            .lock()
            .map_err(|_| lock_failed())?
            .insert(token.as_str().to_string(), owner);
        Ok(())
    }

    /// Simulate the server being down for every call.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make every [`invalidate`](SessionAuthority::invalidate) call take
    /// `delay` before it completes.
    pub fn set_invalidate_delay(&self, delay: Duration) {
        if let Ok(mut current) = self.invalidate_delay.lock() {
            *current = delay;
        }
    }

    /// Tokens invalidated so far, in call order (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn invalidated(&self) -> Result<Vec<Token>, AuthorityError> {
        Ok(self.invalidated.lock().map_err(|_| lock_failed())?.clone())
    }

    fn check_reachable(&self) -> Result<(), AuthorityError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AuthorityError::Unreachable("mock authority offline".to_string()));
        }
        Ok(())
    }
}

impl SessionAuthority for MockSessionAuthority {
    fn validate_and_fetch_session_owner(
        &self,
        token: &Token,
    ) -> impl Future<Output = Result<SessionOwner, AuthorityError>> + Send {
        let result = self.check_reachable().and_then(|()| {
            self.owners
                .lock()
                .map_err(|_| lock_failed())?
                .get(token.as_str())
                .cloned()
                .ok_or_else(|| AuthorityError::Rejected("unknown token".to_string()))
        });

        async move { result }
    }

    fn invalidate(&self, token: &Token) -> impl Future<Output = Result<(), AuthorityError>> + Send {
        let owners = Arc::clone(&self.owners);
        let invalidated = Arc::clone(&self.invalidated);
        let reachable = self.check_reachable();
        let delay = self.invalidate_delay.lock().map(|delay| *delay).unwrap_or_default();
        let token = token.clone();

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reachable?;
            owners.lock().map_err(|_| lock_failed())?.remove(token.as_str());
            invalidated.lock().map_err(|_| lock_failed())?.push(token);
            Ok(())
        }
    }
}
