//! Session controller.
//!
//! Tracks whether the local session is active and expires it after a
//! period of inactivity.
//!
//! # State Machine
//!
//! ```text
//!              begin_session / restore (valid token)
//!   Inactive ─────────────────────────────────────────► Active
//!      ▲                                                 │  ▲
//!      │   end_session | inactivity timer fires          │  │ record_activity
//!      └─────────────────────────────────────────────────┘  │ (restart timer)
//!                                                        └──┘
//! ```
//!
//! While Active exactly one inactivity timer is pending. Every timer carries
//! the generation it was scheduled under; a timer whose generation is no
//! longer current does nothing when it fires.

use crate::config::KeeperConfig;
use crate::constants::keys;
use crate::error::SessionError;
use crate::metrics::SESSIONS_EXPIRED;
use crate::notifier::{ChangeNotifier, ExternalChange};
use crate::providers::{SessionAuthority, SessionOwner};
use crate::store::AtomicTokenStore;
use crate::verifier::{ConsistencyReport, ConsistencyVerifier};
use session_keeper_core::{StorageBackend, Token};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Event channel capacity.
const EVENT_CAPACITY: usize = 16;

/// Events published by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session expired from inactivity. Local state is already cleared.
    Expired,
    /// Another context changed a backend.
    ExternalChange(ExternalChange),
}

/// Pending inactivity timer.
struct TimerHandle {
    generation: u64,
    task: JoinHandle<()>,
}

/// Mutable controller state. Guarded by a synchronous mutex that is never
/// held across an await point.
#[derive(Default)]
struct ActivityState {
    session_active: bool,
    last_activity_at: Option<Instant>,
    timeout: Duration,
    timeout_handle: Option<TimerHandle>,
    generation: u64,
    owner: Option<SessionOwner>,
}

impl ActivityState {
    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timeout_handle.take() {
            handle.task.abort();
        }
    }

    /// Leave Active. Returns whether the session was active.
    fn deactivate(&mut self) -> bool {
        let was_active = self.session_active;
        self.cancel_timer();
        self.session_active = false;
        self.last_activity_at = None;
        self.owner = None;
        self.generation += 1;
        was_active
    }
}

struct Inner<D: StorageBackend, E: StorageBackend, A: SessionAuthority> {
    store: Arc<AtomicTokenStore<D, E>>,
    verifier: ConsistencyVerifier<D, E>,
    authority: A,
    config: KeeperConfig,
    state: Mutex<ActivityState>,
    events: broadcast::Sender<SessionEvent>,
    relay: Mutex<Option<(ChangeNotifier, JoinHandle<()>)>>,
}

/// Owns the local session lifecycle.
///
/// Cloning yields another handle to the same controller.
///
/// # Type Parameters
///
/// - `D`: Durable backend
/// - `E`: Ephemeral backend
/// - `A`: Server-side session authority
pub struct SessionController<D: StorageBackend, E: StorageBackend, A: SessionAuthority> {
    inner: Arc<Inner<D, E, A>>,
}

impl<D: StorageBackend, E: StorageBackend, A: SessionAuthority> Clone for SessionController<D, E, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: StorageBackend, E: StorageBackend, A: SessionAuthority> SessionController<D, E, A> {
    /// Create an Inactive controller.
    #[must_use]
    pub fn new(store: Arc<AtomicTokenStore<D, E>>, authority: A, config: KeeperConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let verifier = ConsistencyVerifier::new(Arc::clone(&store));
        Self {
            inner: Arc::new(Inner {
                store,
                verifier,
                authority,
                config,
                state: Mutex::new(ActivityState::default()),
                events,
                relay: Mutex::new(None),
            }),
        }
    }

    /// Create a controller and restore a stored session.
    ///
    /// A stored token is validated with the authority. If it is accepted
    /// the controller starts Active with the configured session timeout;
    /// otherwise the token is cleared and the controller starts Inactive.
    /// Failures are logged, never returned.
    pub async fn restore(store: Arc<AtomicTokenStore<D, E>>, authority: A, config: KeeperConfig) -> Self {
        let controller = Self::new(store, authority, config);
        controller.restore_session().await;
        controller
    }

    async fn restore_session(&self) {
        let Some(token) = self.inner.store.get_token().await else {
            tracing::debug!("No stored session to restore");
            return;
        };

        match self
            .inner
            .authority
            .validate_and_fetch_session_owner(&token)
            .await
        {
            Ok(owner) => {
                tracing::info!(user_id = %owner.user_id, "Restored session");
                let timeout = self.inner.config.session_timeout;
                let mut state = self.inner.lock_state();
                state.owner = Some(owner);
                self.inner.activate(&mut state, timeout);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Stored session rejected, clearing token");
                if let Err(e) = self.inner.store.clear_token().await {
                    tracing::warn!(error = %e, "Failed to clear rejected token");
                }
            }
        }
    }

    /// Store `token` and enter Active with a fresh inactivity timer.
    ///
    /// Calling this while Active replaces the session and its timer.
    ///
    /// # Errors
    ///
    /// Returns the store error if the token could not be stored. The
    /// controller is Inactive afterwards.
    pub async fn begin_session(
        &self,
        token: Token,
        remember: bool,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        // Stop the previous timer before writing so it cannot clear the
        // new token.
        self.inner.lock_state().deactivate();

        if let Err(e) = self.inner.store.set_token(&token, remember).await {
            tracing::error!(error = %e, "Failed to store session token");
            return Err(e.into());
        }

        let mut state = self.inner.lock_state();
        self.inner.activate(&mut state, timeout);
        drop(state);

        tracing::info!(remember, timeout = ?timeout, "Session started");
        Ok(())
    }

    /// Restart the inactivity timer.
    ///
    /// Cheap and synchronous: never touches storage. No-op while Inactive.
    pub fn record_activity(&self) {
        let mut state = self.inner.lock_state();
        if !state.session_active {
            return;
        }
        let timeout = state.timeout;
        self.inner.schedule_timer(&mut state, timeout);
    }

    /// End the session: cancel the timer, leave Active and clear the token.
    ///
    /// Unconditional. Storage errors are logged and do not keep the
    /// session alive.
    pub async fn end_session(&self) {
        let was_active = self.inner.lock_state().deactivate();

        if let Err(e) = self.inner.store.clear_token().await {
            tracing::warn!(error = %e, "Failed to clear token on logout");
        }

        tracing::info!(was_active, "Session ended");
    }

    /// Current token. `None` while Inactive.
    pub async fn get_token(&self) -> Option<Token> {
        if !self.is_active() {
            return None;
        }
        self.inner.store.get_token().await
    }

    /// Replace the token of the active session, keeping its storage mode.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotActive`] if there is no active session
    /// - [`SessionError::Store`] if the store rejected the rotation
    pub async fn rotate_token(&self, new_token: Token) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::NotActive);
        }
        self.inner.store.rotate_token(&new_token, None).await?;
        Ok(())
    }

    /// Check that the token lives in at most one backend.
    ///
    /// # Errors
    ///
    /// Returns the store error if the lease or a backend failed.
    pub async fn verify_consistency(&self) -> Result<ConsistencyReport, SessionError> {
        Ok(self.inner.verifier.verify().await?)
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Relay token changes observed by `notifier` as
    /// [`SessionEvent::ExternalChange`].
    ///
    /// Replaces any previously attached notifier. Must be called from within
    /// a Tokio runtime.
    pub fn attach_notifier(&self, notifier: ChangeNotifier) {
        let mut subscription = notifier.subscribe();
        let events = self.inner.events.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = subscription.recv().await {
                // Lease churn is internal to the store.
                if change.key == keys::TOKEN {
                    let _ = events.send(SessionEvent::ExternalChange(change));
                }
            }
        });

        let previous = match self.inner.relay.lock() {
            Ok(mut relay) => relay.replace((notifier, task)),
            Err(poisoned) => poisoned.into_inner().replace((notifier, task)),
        };
        if let Some((_, task)) = previous {
            task.abort();
        }
    }

    /// Teardown: leave Active, stop relaying changes and release any held
    /// lease. The stored token is kept, and later activity arms no timer.
    pub async fn shutdown(&self) {
        self.inner.lock_state().deactivate();

        let relay = match self.inner.relay.lock() {
            Ok(mut relay) => relay.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some((_, task)) = relay {
            task.abort();
        }

        self.inner.store.shutdown().await;
        tracing::debug!("Session controller shut down");
    }

    /// Returns `true` while a session is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock_state().session_active
    }

    /// Owner of a restored session, if known.
    #[must_use]
    pub fn session_owner(&self) -> Option<SessionOwner> {
        self.inner.lock_state().owner.clone()
    }

    /// When activity was last recorded.
    #[must_use]
    pub fn last_activity(&self) -> Option<Instant> {
        self.inner.lock_state().last_activity_at
    }

    /// Time left before the session expires.
    #[must_use]
    pub fn time_remaining(&self) -> Option<Duration> {
        let state = self.inner.lock_state();
        let last = state.last_activity_at?;
        state.session_active.then(|| state.timeout.saturating_sub(last.elapsed()))
    }

    /// Number of pending inactivity timers (zero or one).
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        let state = self.inner.lock_state();
        usize::from(
            state
                .timeout_handle
                .as_ref()
                .is_some_and(|handle| !handle.task.is_finished()),
        )
    }

    /// Token store behind this controller.
    #[must_use]
    pub fn store(&self) -> &Arc<AtomicTokenStore<D, E>> {
        &self.inner.store
    }
}

impl<D: StorageBackend, E: StorageBackend, A: SessionAuthority> Inner<D, E, A> {
    fn lock_state(&self) -> MutexGuard<'_, ActivityState> {
        // State updates are single assignments, so a poisoned lock still
        // holds a usable state.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn activate(self: &Arc<Self>, state: &mut ActivityState, timeout: Duration) {
        state.session_active = true;
        state.timeout = timeout;
        self.schedule_timer(state, timeout);
    }

    /// Replace the pending timer with a new one firing after `timeout`.
    fn schedule_timer(self: &Arc<Self>, state: &mut ActivityState, timeout: Duration) {
        state.cancel_timer();
        state.generation += 1;
        state.last_activity_at = Some(Instant::now());

        let generation = state.generation;
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(generation).await;
            }
        });

        state.timeout_handle = Some(TimerHandle { generation, task });
    }

    /// Timer callback.
    ///
    /// The state is Inactive before the first await. A `begin_session`,
    /// `end_session` or `shutdown` that lands while expiry waits on storage
    /// or the authority moves the generation on, and expiry then leaves the
    /// newer state and its token alone.
    async fn expire(&self, generation: u64) {
        let expired_generation = {
            let mut state = self.lock_state();
            let current = state
                .timeout_handle
                .as_ref()
                .is_some_and(|handle| handle.generation == generation);
            if !state.session_active || !current {
                return;
            }
            // Detach rather than abort: this task is the one running.
            state.timeout_handle = None;
            state.session_active = false;
            state.last_activity_at = None;
            state.owner = None;
            state.generation += 1;
            state.generation
        };

        tracing::info!("Session expired from inactivity");
        metrics::counter!(SESSIONS_EXPIRED).increment(1);

        let token = self.store.get_token().await;
        if let Some(token) = &token {
            if let Err(e) = self.authority.invalidate(token).await {
                tracing::warn!(error = %e, "Server-side invalidation failed");
            }
        }

        if self.superseded(expired_generation) {
            tracing::debug!("Session state changed during expiry, keeping it");
            return;
        }

        if let Some(token) = &token {
            match self.store.clear_token_if(token).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!("Expired token already replaced in storage"),
                Err(e) => tracing::warn!(error = %e, "Failed to clear expired token"),
            }
        }

        if self.superseded(expired_generation) {
            tracing::debug!("Session state changed during expiry, keeping it");
            return;
        }

        let _ = self.events.send(SessionEvent::Expired);
    }

    /// Returns `true` once the state has moved past `generation`.
    fn superseded(&self, generation: u64) -> bool {
        self.lock_state().generation != generation
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::mocks::{FlakyBackend, MockSessionAuthority};
    use session_keeper_core::StorageMode;
    use tokio::sync::broadcast::error::TryRecvError;

    type Controller = SessionController<MemoryBackend, MemoryBackend, MockSessionAuthority>;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn controller() -> (Controller, MockSessionAuthority) {
        let config = KeeperConfig::default();
        let store = Arc::new(AtomicTokenStore::new(
            MemoryBackend::new(),
            MemoryBackend::new(),
            &config,
        ));
        let authority = MockSessionAuthority::new();
        (Controller::new(store, authority.clone(), config), authority)
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_session_activates_with_one_timer() {
        let (controller, _) = controller();

        controller
            .begin_session(Token::from("tok"), true, TIMEOUT)
            .await
            .unwrap();

        assert!(controller.is_active());
        assert_eq!(controller.pending_timers(), 1);
        assert_eq!(controller.get_token().await, Some(Token::from("tok")));
        assert_eq!(
            controller.store().get_storage_mode().await.unwrap(),
            StorageMode::Durable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactivity_expires_session() {
        let (controller, authority) = controller();
        let mut events = controller.subscribe();
        controller
            .begin_session(Token::from("tok-A"), false, TIMEOUT)
            .await
            .unwrap();

        tokio::time::sleep(TIMEOUT + Duration::from_millis(10)).await;

        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(controller.store().get_token().await, None);
        assert_eq!(authority.invalidated().unwrap(), vec![Token::from("tok-A")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_expiry() {
        let (controller, _) = controller();
        controller
            .begin_session(Token::from("tok"), false, TIMEOUT)
            .await
            .unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            controller.record_activity();
            assert_eq!(controller.pending_timers(), 1);
        }

        assert!(controller.is_active());
        assert_eq!(controller.get_token().await, Some(Token::from("tok")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_activity_while_inactive_is_noop() {
        let (controller, _) = controller();

        controller.record_activity();

        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(controller.last_activity(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_session_while_active_replaces_timer() {
        let (controller, _) = controller();
        controller
            .begin_session(Token::from("first"), false, TIMEOUT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        controller
            .begin_session(Token::from("second"), false, TIMEOUT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The first timer would have fired by now.
        assert!(controller.is_active());
        assert_eq!(controller.pending_timers(), 1);
        assert_eq!(controller.get_token().await, Some(Token::from("second")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_clears_everything() {
        let (controller, authority) = controller();
        controller
            .begin_session(Token::from("tok"), true, TIMEOUT)
            .await
            .unwrap();

        controller.end_session().await;

        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(controller.store().get_token().await, None);
        // Logout does not go through the expiry path.
        assert!(authority.invalidated().unwrap().is_empty());

        // Ending again is harmless.
        controller.end_session().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_succeeds_when_storage_fails() {
        let config = KeeperConfig::default();
        let ephemeral = FlakyBackend::new(MemoryBackend::new());
        let store = Arc::new(AtomicTokenStore::new(
            MemoryBackend::new(),
            ephemeral.clone(),
            &config,
        ));
        let controller = SessionController::new(store, MockSessionAuthority::new(), config);
        controller
            .begin_session(Token::from("tok"), false, TIMEOUT)
            .await
            .unwrap();

        ephemeral.fail_all(true);
        controller.end_session().await;

        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_requires_active_session() {
        let (controller, _) = controller();

        assert_eq!(
            controller.rotate_token(Token::from("new")).await,
            Err(SessionError::NotActive)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_keeps_mode() {
        let (controller, _) = controller();
        controller
            .begin_session(Token::from("old"), true, TIMEOUT)
            .await
            .unwrap();

        controller.rotate_token(Token::from("new")).await.unwrap();

        assert_eq!(controller.get_token().await, Some(Token::from("new")));
        assert_eq!(
            controller.store().get_storage_mode().await.unwrap(),
            StorageMode::Durable
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_token_is_none_while_inactive() {
        let (controller, _) = controller();
        controller
            .store()
            .set_token(&Token::from("stored"), true)
            .await
            .unwrap();

        assert_eq!(controller.get_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_valid_token() {
        let config = KeeperConfig::default().with_session_timeout(TIMEOUT);
        let store = Arc::new(AtomicTokenStore::new(
            MemoryBackend::new(),
            MemoryBackend::new(),
            &config,
        ));
        let token = Token::from("persisted");
        store.set_token(&token, true).await.unwrap();
        let authority = MockSessionAuthority::new();
        authority
            .register(&token, SessionOwner::new("user-1"))
            .unwrap();

        let controller = SessionController::restore(store, authority, config).await;

        assert!(controller.is_active());
        assert_eq!(controller.pending_timers(), 1);
        assert_eq!(controller.session_owner().unwrap().user_id, "user-1");
        assert!(
            controller
                .time_remaining()
                .is_some_and(|left| left > Duration::ZERO && left <= TIMEOUT)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_rejected_token_clears_it() {
        let config = KeeperConfig::default();
        let store = Arc::new(AtomicTokenStore::new(
            MemoryBackend::new(),
            MemoryBackend::new(),
            &config,
        ));
        store.set_token(&Token::from("revoked"), true).await.unwrap();

        let controller =
            SessionController::restore(Arc::clone(&store), MockSessionAuthority::new(), config)
                .await;

        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(store.get_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timer_and_keeps_token() {
        let (controller, _) = controller();
        controller
            .begin_session(Token::from("tok"), true, TIMEOUT)
            .await
            .unwrap();

        controller.shutdown().await;
        tokio::time::sleep(TIMEOUT * 2).await;

        assert_eq!(
            controller.store().get_token().await,
            Some(Token::from("tok"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_after_shutdown_arms_no_timer() {
        let (controller, _) = controller();
        controller
            .begin_session(Token::from("tok"), true, TIMEOUT)
            .await
            .unwrap();

        controller.shutdown().await;
        controller.record_activity();

        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(controller.get_token().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_slow_expiry_is_kept() {
        let (controller, authority) = controller();
        authority.set_invalidate_delay(Duration::from_millis(100));
        let mut events = controller.subscribe();
        controller
            .begin_session(Token::from("old"), true, TIMEOUT)
            .await
            .unwrap();

        // The timer has fired and expiry is waiting on the authority.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!controller.is_active());
        assert!(authority.invalidated().unwrap().is_empty());

        controller
            .begin_session(Token::from("new"), true, Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(authority.invalidated().unwrap(), vec![Token::from("old")]);
        assert!(controller.is_active());
        assert_eq!(controller.pending_timers(), 1);
        assert_eq!(controller.store().get_token().await, Some(Token::from("new")));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_slow_expiry_sends_no_expiry() {
        let (controller, authority) = controller();
        authority.set_invalidate_delay(Duration::from_millis(100));
        let mut events = controller.subscribe();
        controller
            .begin_session(Token::from("tok"), true, TIMEOUT)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        controller.end_session().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(authority.invalidated().unwrap(), vec![Token::from("tok")]);
        assert!(!controller.is_active());
        assert_eq!(controller.pending_timers(), 0);
        assert_eq!(controller.store().get_token().await, None);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_expiry_without_interference_clears_and_notifies() {
        let (controller, authority) = controller();
        authority.set_invalidate_delay(Duration::from_millis(100));
        let mut events = controller.subscribe();
        controller
            .begin_session(Token::from("tok"), false, TIMEOUT)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
        assert_eq!(controller.store().get_token().await, None);
    }
}
