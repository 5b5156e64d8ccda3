//! Atomic token store.
//!
//! Persists one token in exactly one of two backends. Every operation is a
//! single critical section under the [`LeaseMutex`]:
//!
//! ```text
//! acquire lease → mutate both backends → verify by re-reading → release
//! ```
//!
//! The lease is released on every exit path, including verification
//! failures and backend errors.

use crate::config::KeeperConfig;
use crate::constants::keys;
use crate::error::{Result, StoreError};
use crate::metrics::{DEGRADED_READS, VERIFICATION_FAILURES};
use crate::mutex::LeaseMutex;
use crate::verifier;
use session_keeper_core::environment::{Clock, SystemClock};
use session_keeper_core::{BackendKind, StorageBackend, StorageMode, Token};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Raw values of the token key in each backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Snapshot {
    pub(crate) durable: Option<String>,
    pub(crate) ephemeral: Option<String>,
}

impl Snapshot {
    fn get(&self, kind: BackendKind) -> Option<&str> {
        match kind {
            BackendKind::Durable => self.durable.as_deref(),
            BackendKind::Ephemeral => self.ephemeral.as_deref(),
        }
    }

    /// Session-scoped value first, then the durable one.
    fn preferred(self) -> Option<Token> {
        self.ephemeral.or(self.durable).map(Token::from)
    }

    const fn mode(&self) -> StorageMode {
        StorageMode::classify(self.durable.is_some(), self.ephemeral.is_some())
    }
}

/// Token store with an all-or-nothing contract across two backends.
///
/// Construct one instance per context and inject it where needed; call
/// [`init`](Self::init) at startup and [`shutdown`](Self::shutdown) at
/// teardown.
///
/// # Type Parameters
///
/// - `D`: Durable backend (also holds the mutex lease)
/// - `E`: Ephemeral backend
pub struct AtomicTokenStore<D: StorageBackend, E: StorageBackend> {
    durable: D,
    ephemeral: E,
    mutex: LeaseMutex<D>,
    operation_timeout: Duration,
}

impl<D: StorageBackend, E: StorageBackend> AtomicTokenStore<D, E> {
    /// Create a store using the system clock.
    #[must_use]
    pub fn new(durable: D, ephemeral: E, config: &KeeperConfig) -> Self {
        Self::with_clock(durable, ephemeral, Arc::new(SystemClock), config)
    }

    /// Create a store with an injected clock for lease ageing.
    #[must_use]
    pub fn with_clock(durable: D, ephemeral: E, clock: Arc<dyn Clock>, config: &KeeperConfig) -> Self {
        let mutex = LeaseMutex::new(durable.clone(), clock, config);
        Self {
            durable,
            ephemeral,
            mutex,
            operation_timeout: config.operation_timeout,
        }
    }

    /// Durable backend handle.
    pub const fn durable(&self) -> &D {
        &self.durable
    }

    /// Ephemeral backend handle.
    pub const fn ephemeral(&self) -> &E {
        &self.ephemeral
    }

    /// Mutex coordinating this store with other contexts.
    pub const fn mutex(&self) -> &LeaseMutex<D> {
        &self.mutex
    }

    /// Startup hook.
    ///
    /// Removes a lease abandoned by a context that died mid-operation and
    /// logs any inconsistency left behind. Never repairs token state.
    ///
    /// # Errors
    ///
    /// Returns error if a backend cannot be read.
    pub async fn init(&self) -> Result<()> {
        if self.mutex.clear_abandoned().await? {
            tracing::info!("Cleared abandoned lease during token store init");
        }

        let snapshot = self.read_both().await?;
        let report = verifier::classify(snapshot.durable.as_deref(), snapshot.ephemeral.as_deref());
        if report.consistent {
            tracing::debug!(mode = ?report.mode, "Token store initialized");
        } else {
            tracing::warn!(issues = ?report.issues, "Token store initialized with inconsistent state");
        }
        Ok(())
    }

    /// Teardown hook: releases any lease still owned by this instance.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.mutex.release_owned().await;
        tracing::debug!("Token store shut down");
    }

    /// Read the token, preferring the ephemeral backend.
    ///
    /// Best-effort: if the lease cannot be obtained in time this falls back
    /// to a direct read (see below), and other failures read as `None`.
    /// Use [`try_get_token`](Self::try_get_token) to observe errors.
    pub async fn get_token(&self) -> Option<Token> {
        match self.try_get_token().await {
            Ok(token) => token,
            Err(StoreError::Unavailable) => {
                // Degraded read: the lease could not be obtained, so both
                // backends are read without it. This can race a writer in
                // another context and may observe a half-finished write.
                // Liveness wins over consistency for this read path only;
                // writes never bypass the lease.
                metrics::counter!(DEGRADED_READS).increment(1);
                tracing::warn!("Token lease unavailable, falling back to unguarded read");
                match self.read_both().await {
                    Ok(snapshot) => snapshot.preferred(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Unguarded token read failed");
                        None
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read token");
                None
            }
        }
    }

    /// Read the token under the lease, without the degraded fallback.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] if the lease timed out
    /// - [`StoreError::Backend`] if a backend failed
    pub async fn try_get_token(&self) -> Result<Option<Token>> {
        self.with_lease(async { self.read_both().await.map(Snapshot::preferred) })
            .await
    }

    /// Store `token` in the backend selected by `remember` and remove it
    /// from the other.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] if the lease timed out
    /// - [`StoreError::VerificationFailed`] if the re-read disagrees; the
    ///   operation must be treated as not safely completed
    /// - [`StoreError::Backend`] if a backend failed
    pub async fn set_token(&self, token: &Token, remember: bool) -> Result<()> {
        let target = if remember {
            BackendKind::Durable
        } else {
            BackendKind::Ephemeral
        };

        self.with_lease(self.set_locked(token, target)).await?;

        tracing::debug!(backend = target.as_str(), "Stored token");
        Ok(())
    }

    /// Remove the token from both backends.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] if the lease timed out
    /// - [`StoreError::VerificationFailed`] if either backend still holds
    ///   a token afterwards
    /// - [`StoreError::Backend`] if a backend failed
    pub async fn clear_token(&self) -> Result<()> {
        self.with_lease(self.clear_locked()).await?;

        tracing::debug!("Cleared token");
        Ok(())
    }

    /// Remove the token from both backends only if the stored token is
    /// still `expected`. Returns whether it was cleared.
    ///
    /// A token written since `expected` was read is left in place.
    ///
    /// # Errors
    ///
    /// Same as [`clear_token`](Self::clear_token).
    pub async fn clear_token_if(&self, expected: &Token) -> Result<bool> {
        let cleared = self.with_lease(self.clear_if_locked(expected)).await?;

        if cleared {
            tracing::debug!("Cleared token");
        } else {
            tracing::debug!("Token changed since it was read, leaving it in place");
        }
        Ok(cleared)
    }

    /// Replace the token in a single critical section.
    ///
    /// With `remember == None` the current mode is kept: ephemeral if the
    /// ephemeral backend holds a token, durable if only the durable one
    /// does, and ephemeral when neither does.
    ///
    /// # Errors
    ///
    /// Same as [`set_token`](Self::set_token).
    pub async fn rotate_token(&self, new_token: &Token, remember: Option<bool>) -> Result<()> {
        let target = self
            .with_lease(self.rotate_locked(new_token, remember))
            .await?;

        tracing::info!(backend = target.as_str(), "Rotated token");
        Ok(())
    }

    /// Which backend currently holds the token. Ephemeral wins on conflict.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Unavailable`] if the lease timed out
    /// - [`StoreError::Backend`] if a backend failed
    pub async fn get_storage_mode(&self) -> Result<StorageMode> {
        self.with_lease(async { self.read_both().await.map(|snapshot| snapshot.mode()) })
            .await
    }

    /// Run `body` while holding the lease, releasing it on every path.
    pub(crate) async fn with_lease<T, F>(&self, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut guard = self.mutex.acquire(self.operation_timeout).await?;
        let result = body.await;
        guard.release().await;
        result
    }

    /// Read the token key from both backends. Callers hold the lease unless
    /// documented otherwise.
    pub(crate) async fn read_both(&self) -> Result<Snapshot> {
        let durable = self.durable.get(keys::TOKEN).await?;
        let ephemeral = self.ephemeral.get(keys::TOKEN).await?;
        Ok(Snapshot { durable, ephemeral })
    }

    async fn set_locked(&self, token: &Token, target: BackendKind) -> Result<()> {
        self.backend_set(target, token).await?;
        self.backend_delete(target.other()).await?;
        self.verify_exclusive("set_token", token, target).await
    }

    async fn clear_locked(&self) -> Result<()> {
        self.durable.delete(keys::TOKEN).await?;
        self.ephemeral.delete(keys::TOKEN).await?;

        let snapshot = self.read_both().await?;
        if snapshot.durable.is_some() || snapshot.ephemeral.is_some() {
            return Err(self.verification_failed(
                "clear_token",
                format!("token still present after clear ({:?})", snapshot.mode()),
            ));
        }
        Ok(())
    }

    async fn clear_if_locked(&self, expected: &Token) -> Result<bool> {
        if self.read_both().await?.preferred().as_ref() != Some(expected) {
            return Ok(false);
        }
        self.clear_locked().await?;
        Ok(true)
    }

    async fn rotate_locked(&self, new_token: &Token, remember: Option<bool>) -> Result<BackendKind> {
        let target = match remember {
            Some(true) => BackendKind::Durable,
            Some(false) => BackendKind::Ephemeral,
            None => match self.read_both().await?.mode() {
                StorageMode::Durable => BackendKind::Durable,
                StorageMode::Ephemeral | StorageMode::None => BackendKind::Ephemeral,
            },
        };

        self.durable.delete(keys::TOKEN).await?;
        self.ephemeral.delete(keys::TOKEN).await?;
        self.backend_set(target, new_token).await?;
        self.verify_exclusive("rotate_token", new_token, target).await?;
        Ok(target)
    }

    async fn backend_set(&self, kind: BackendKind, token: &Token) -> Result<()> {
        match kind {
            BackendKind::Durable => self.durable.set(keys::TOKEN, token.as_str()).await?,
            BackendKind::Ephemeral => self.ephemeral.set(keys::TOKEN, token.as_str()).await?,
        }
        Ok(())
    }

    async fn backend_delete(&self, kind: BackendKind) -> Result<()> {
        match kind {
            BackendKind::Durable => self.durable.delete(keys::TOKEN).await?,
            BackendKind::Ephemeral => self.ephemeral.delete(keys::TOKEN).await?,
        }
        Ok(())
    }

    /// Re-read both backends: `target` must hold exactly `token` and the
    /// other backend must be empty.
    async fn verify_exclusive(
        &self,
        operation: &'static str,
        token: &Token,
        target: BackendKind,
    ) -> Result<()> {
        let snapshot = self.read_both().await?;

        if snapshot.get(target) != Some(token.as_str()) {
            return Err(self.verification_failed(
                operation,
                format!("{} backend does not hold the written token", target.as_str()),
            ));
        }

        if snapshot.get(target.other()).is_some() {
            return Err(self.verification_failed(
                operation,
                format!("{} backend still holds a token", target.other().as_str()),
            ));
        }

        Ok(())
    }

    fn verification_failed(&self, operation: &'static str, reason: String) -> StoreError {
        metrics::counter!(VERIFICATION_FAILURES).increment(1);
        tracing::error!(operation, reason = %reason, "Token storage verification failed");
        StoreError::VerificationFailed { reason }
    }
}
