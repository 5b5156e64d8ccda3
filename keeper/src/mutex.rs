//! Lease-based mutex coordinating token writers across contexts.
//!
//! Contexts (processes, tabs, runtimes) that share the durable backend
//! serialize their critical sections through a [`MutexLease`] stored under
//! [`keys::MUTEX`]. Within one context an in-process flag serializes callers
//! cheaply without touching storage.
//!
//! # Algorithm
//!
//! ```text
//! loop until timeout:
//!     in-process flag taken?      → wait for release (or one poll interval)
//!     lease present and fresh?    → release flag, sleep one poll interval
//!     write lease(new holder id)
//!     wait one poll interval      (settle)
//!     re-read lease == ours?      → guard
//!     otherwise                   → lost the race, release flag, retry
//! ```
//!
//! A lease older than `mutex_timeout` belongs to a holder that disappeared
//! mid-operation and is seized. Polling is a latency/load trade-off tuned by
//! `poll_interval`; a notification primitive could replace it without
//! changing [`LeaseMutex::acquire`].
//!
//! [`keys::MUTEX`]: crate::constants::keys::MUTEX

use crate::config::KeeperConfig;
use crate::constants::keys;
use crate::error::AcquireError;
use crate::lease::{HolderId, MutexLease};
use crate::metrics::{LEASE_ACQUIRED, LEASE_SEIZED, LEASE_TIMEOUTS, LEASE_WAIT_SECONDS};
use rand::Rng;
use session_keeper_core::environment::Clock;
use session_keeper_core::{BackendError, StorageBackend};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cross-context mutex backed by a lease in durable storage.
///
/// Cloning yields another handle to the same in-process state: clones
/// belong to the same context.
pub struct LeaseMutex<D: StorageBackend> {
    shared: Arc<Shared<D>>,
}

impl<D: StorageBackend> Clone for LeaseMutex<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<D: StorageBackend> {
    durable: D,
    clock: Arc<dyn Clock>,
    mutex_timeout: Duration,
    poll_interval: Duration,
    /// In-process flag: set while a guard from this context is alive.
    held: AtomicBool,
    /// Wakes one queued same-process waiter on release.
    released: Notify,
    /// Holder id of the lease this context currently owns.
    owned: Mutex<Option<HolderId>>,
}

impl<D: StorageBackend> LeaseMutex<D> {
    /// Create a mutex over `durable`.
    #[must_use]
    pub fn new(durable: D, clock: Arc<dyn Clock>, config: &KeeperConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                durable,
                clock,
                mutex_timeout: config.mutex_timeout,
                poll_interval: config.poll_interval,
                held: AtomicBool::new(false),
                released: Notify::new(),
                owned: Mutex::new(None),
            }),
        }
    }

    /// Acquire the lease, waiting up to `timeout`.
    ///
    /// The returned guard releases the lease when [`LeaseGuard::release`] is
    /// awaited or, failing that, when it is dropped.
    ///
    /// # Errors
    ///
    /// - [`AcquireError::Timeout`] if the lease stayed held by someone else
    ///   for the whole `timeout`
    /// - [`AcquireError::Backend`] if the durable backend was still failing
    ///   when `timeout` ran out; failures before that are retried. No
    ///   partial lock state is retained
    pub async fn acquire(&self, timeout: Duration) -> Result<LeaseGuard<D>, AcquireError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut last_error: Option<BackendError> = None;

        loop {
            if self.shared.try_hold_local() {
                match self.shared.try_claim().await {
                    Ok(Some(holder)) => {
                        let waited = started.elapsed();
                        self.shared.set_owned(Some(holder.clone()));
                        metrics::counter!(LEASE_ACQUIRED).increment(1);
                        metrics::histogram!(LEASE_WAIT_SECONDS).record(waited.as_secs_f64());
                        tracing::debug!(
                            holder = %holder,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            "Acquired token lease"
                        );
                        return Ok(LeaseGuard {
                            shared: Arc::clone(&self.shared),
                            holder,
                            released: false,
                        });
                    }
                    Ok(None) => {
                        self.shared.release_local();
                        last_error = None;
                    }
                    Err(e) => {
                        self.shared.release_local();
                        tracing::warn!(error = %e, "Lease storage failed during acquisition, retrying");
                        last_error = Some(e);
                    }
                }

                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(self.gave_up(started, last_error));
                };
                tokio::time::sleep(self.shared.jittered_poll().min(remaining)).await;
            } else {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    return Err(self.gave_up(started, last_error));
                };
                let wait = self.shared.poll_interval.min(remaining);
                let _ = tokio::time::timeout(wait, self.shared.released.notified()).await;
            }

            if Instant::now() >= deadline {
                return Err(self.gave_up(started, last_error));
            }
        }
    }

    /// Returns `true` while a guard from this context is alive.
    #[must_use]
    pub fn is_held_locally(&self) -> bool {
        self.shared.held.load(Ordering::Acquire)
    }

    /// Read the lease currently stored, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the durable backend cannot be read.
    pub async fn current_lease(&self) -> Result<Option<MutexLease>, BackendError> {
        let raw = self.shared.durable.get(keys::MUTEX).await?;
        Ok(raw.as_deref().and_then(MutexLease::parse))
    }

    /// Remove a stored lease that has outlived `mutex_timeout`.
    ///
    /// Returns `true` if an abandoned lease was removed.
    ///
    /// # Errors
    ///
    /// Returns error if the durable backend fails.
    pub async fn clear_abandoned(&self) -> Result<bool, BackendError> {
        let Some(raw) = self.shared.durable.get(keys::MUTEX).await? else {
            return Ok(false);
        };

        let abandoned = MutexLease::parse(&raw).is_none_or(|lease| {
            lease.is_stale(self.shared.clock.now(), self.shared.mutex_timeout)
        });
        if !abandoned {
            return Ok(false);
        }

        self.shared.durable.delete(keys::MUTEX).await?;
        tracing::info!("Removed abandoned token lease");
        Ok(true)
    }

    /// Delete any lease this context still owns.
    ///
    /// Runs the same cleanup as an unload handler; safe to call at any time
    /// and more than once.
    pub async fn release_owned(&self) {
        let owned = self.shared.owned.lock().ok().and_then(|mut owned| owned.take());
        if let Some(holder) = owned {
            self.shared.delete_if_owned(&holder).await;
        }
    }

    /// Error for an acquisition that hit its deadline: the storage error if
    /// the last attempt failed, a timeout otherwise.
    fn gave_up(&self, started: Instant, last_error: Option<BackendError>) -> AcquireError {
        if let Some(e) = last_error {
            tracing::warn!(error = %e, "Lease storage kept failing until the deadline");
            return AcquireError::Backend(e);
        }

        let waited = started.elapsed();
        metrics::counter!(LEASE_TIMEOUTS).increment(1);
        tracing::warn!(
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "Timed out waiting for token lease"
        );
        AcquireError::Timeout { waited }
    }
}

impl<D: StorageBackend> Shared<D> {
    fn try_hold_local(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release_local(&self) {
        self.held.store(false, Ordering::Release);
        self.released.notify_one();
    }

    fn set_owned(&self, holder: Option<HolderId>) {
        if let Ok(mut owned) = self.owned.lock() {
            *owned = holder;
        }
    }

    fn clear_owned_if(&self, holder: &HolderId) {
        if let Ok(mut owned) = self.owned.lock() {
            if owned.as_ref() == Some(holder) {
                *owned = None;
            }
        }
    }

    fn jittered_poll(&self) -> Duration {
        let max_jitter = u64::try_from(self.poll_interval.as_micros() / 2).unwrap_or(0);
        if max_jitter == 0 {
            return self.poll_interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        self.poll_interval + Duration::from_micros(jitter)
    }

    /// One acquisition attempt against storage.
    ///
    /// Returns the new holder id if the lease was written and read back.
    async fn try_claim(&self) -> Result<Option<HolderId>, BackendError> {
        let now = self.clock.now();

        if let Some(raw) = self.durable.get(keys::MUTEX).await? {
            match MutexLease::parse(&raw) {
                Some(lease) if !lease.is_stale(now, self.mutex_timeout) => return Ok(None),
                Some(lease) => {
                    metrics::counter!(LEASE_SEIZED).increment(1);
                    tracing::info!(
                        previous_holder = %lease.holder_id,
                        age_ms = u64::try_from(lease.age(now).as_millis()).unwrap_or(u64::MAX),
                        "Seizing abandoned token lease"
                    );
                }
                None => {
                    tracing::warn!("Unparseable token lease found, treating it as abandoned");
                }
            }
        }

        let holder = HolderId::generate();
        let lease = MutexLease::new(holder.clone(), now);
        self.durable.set(keys::MUTEX, &lease.encode()).await?;

        // Double-check: a writer that read the lease before our write lands
        // its own within the settle window and wins instead of us.
        if !self.poll_interval.is_zero() {
            tokio::time::sleep(self.poll_interval).await;
        }
        let confirmed = match self.durable.get(keys::MUTEX).await {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.delete_if_owned(&holder).await;
                return Err(e);
            }
        };
        let ours = confirmed
            .as_deref()
            .and_then(MutexLease::parse)
            .is_some_and(|stored| stored.holder_id == holder);

        if ours {
            Ok(Some(holder))
        } else {
            tracing::debug!(holder = %holder, "Lost token lease race, retrying");
            Ok(None)
        }
    }

    /// Delete the stored lease if it still names `holder`.
    ///
    /// A lease seized by another context after ours went stale is left
    /// alone. Failures are logged, never returned.
    async fn delete_if_owned(&self, holder: &HolderId) {
        self.clear_owned_if(holder);

        let stored = match self.durable.get(keys::MUTEX).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(holder = %holder, error = %e, "Failed to read token lease on release");
                return;
            }
        };

        match stored.as_deref().and_then(MutexLease::parse) {
            Some(lease) if lease.holder_id == *holder => {
                if let Err(e) = self.durable.delete(keys::MUTEX).await {
                    tracing::warn!(
                        holder = %holder,
                        error = %e,
                        "Failed to delete token lease on release; it will expire"
                    );
                } else {
                    tracing::debug!(holder = %holder, "Released token lease");
                }
            }
            Some(lease) => {
                tracing::debug!(
                    holder = %holder,
                    current_holder = %lease.holder_id,
                    "Token lease already taken over, leaving it in place"
                );
            }
            None => {}
        }
    }
}

/// Scoped ownership of the token lease.
///
/// Await [`release`](Self::release) on the normal path. If the guard is
/// dropped unreleased (early return, `?`, panic), the in-process flag is
/// cleared immediately and the stored lease is deleted on the ambient tokio
/// runtime.
pub struct LeaseGuard<D: StorageBackend> {
    shared: Arc<Shared<D>>,
    holder: HolderId,
    released: bool,
}

impl<D: StorageBackend> LeaseGuard<D> {
    /// Holder id written for this acquisition.
    #[must_use]
    pub const fn holder_id(&self) -> &HolderId {
        &self.holder
    }

    /// Release the lease.
    ///
    /// Idempotent: later calls are no-ops. Never fails, including when the
    /// lease was already seized by another context.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.delete_if_owned(&self.holder).await;
        self.shared.release_local();
    }
}

impl<D: StorageBackend> Drop for LeaseGuard<D> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shared.clear_owned_if(&self.holder);
        self.shared.release_local();

        let shared = Arc::clone(&self.shared);
        let holder = self.holder.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!(holder = %holder, "Lease guard dropped unreleased, scheduling cleanup");
            handle.spawn(async move {
                shared.delete_if_owned(&holder).await;
            });
        } else {
            tracing::warn!(
                holder = %holder,
                "Lease guard dropped outside a runtime; stored lease will expire"
            );
        }
    }
}
