//! # Session Keeper Testing
//!
//! Testing utilities and helpers for Session Keeper.
//!
//! This crate provides:
//! - Deterministic [`Clock`] implementations
//! - A backend wrapper that forces concurrent operations to interleave
//! - A harness simulating several contexts over shared backends
//! - Property-based testing strategies
//! - Test log output
//!
//! ## Example
//!
//! ```ignore
//! use session_keeper_testing::ContextHarness;
//!
//! #[tokio::test]
//! async fn test_two_tabs() {
//!     let harness = ContextHarness::new(KeeperConfig::for_profile(Profile::Test));
//!     let tab_a = harness.context();
//!     let tab_b = harness.context();
//!
//!     tab_a.set_token(&Token::from("tok"), true).await.unwrap();
//!     assert_eq!(tab_b.get_token().await, Some(Token::from("tok")));
//! }
//! ```

use chrono::{DateTime, Utc};
use session_keeper_core::environment::Clock;

/// Mock implementations of Environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use session_keeper_core::backend::Result;
    use session_keeper_core::{ChangeFeed, StorageBackend};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use session_keeper_testing::mocks::FixedClock;
    /// use session_keeper_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and
    /// advance it while a store owns another. Used to age leases past the
    /// mutex timeout without sleeping.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: Duration) {
            let Ok(delta) = chrono::Duration::from_std(by) else {
                return;
            };
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Backend wrapper that yields to the scheduler before every operation.
    ///
    /// In-memory backends complete on their first poll, so concurrent
    /// critical sections over them run back to back. Wrapping them forces a
    /// task switch at each storage access, which lets contexts on one
    /// runtime race for the lease.
    #[derive(Debug, Clone)]
    pub struct YieldingBackend<B> {
        inner: B,
    }

    impl<B: StorageBackend> YieldingBackend<B> {
        /// Wrap `inner`.
        #[must_use]
        pub const fn new(inner: B) -> Self {
            Self { inner }
        }

        /// Wrapped backend.
        #[must_use]
        pub const fn inner(&self) -> &B {
            &self.inner
        }
    }

    impl<B: StorageBackend> StorageBackend for YieldingBackend<B> {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }

        fn watch(&self) -> Option<ChangeFeed> {
            self.inner.watch()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089))
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use super::mocks::{ManualClock, YieldingBackend};
    use session_keeper::backends::MemoryBackend;
    use session_keeper::{AtomicTokenStore, KeeperConfig};
    use std::sync::Arc;

    /// Store type produced by [`ContextHarness`].
    pub type MemoryStore = AtomicTokenStore<MemoryBackend, MemoryBackend>;

    /// Store type whose storage accesses yield; see [`YieldingBackend`].
    pub type RacingStore =
        AtomicTokenStore<YieldingBackend<MemoryBackend>, YieldingBackend<MemoryBackend>>;

    /// Install a test log subscriber honoring `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Simulates several contexts of one user agent.
    ///
    /// Every context shares the durable medium. [`context`](Self::context)
    /// gives each context its own ephemeral backend, the way browser tabs
    /// have their own session storage; [`shared_context`](Self::shared_context)
    /// shares the ephemeral medium too, the way threads of one process
    /// would.
    #[derive(Debug, Clone)]
    pub struct ContextHarness {
        durable: MemoryBackend,
        ephemeral: MemoryBackend,
        clock: ManualClock,
        config: KeeperConfig,
    }

    impl ContextHarness {
        /// Create a harness with empty media.
        #[must_use]
        pub fn new(config: KeeperConfig) -> Self {
            Self {
                durable: MemoryBackend::new(),
                ephemeral: MemoryBackend::new(),
                clock: ManualClock::default(),
                config,
            }
        }

        /// Open a context with its own ephemeral backend.
        #[must_use]
        pub fn context(&self) -> MemoryStore {
            self.store(MemoryBackend::new())
        }

        /// Open a context sharing the ephemeral medium with other shared
        /// contexts.
        #[must_use]
        pub fn shared_context(&self) -> MemoryStore {
            self.store(self.ephemeral.connect())
        }

        /// Open a shared context whose storage accesses yield, so that
        /// concurrent operations from several such contexts interleave.
        #[must_use]
        pub fn racing_context(&self) -> RacingStore {
            AtomicTokenStore::with_clock(
                YieldingBackend::new(self.durable.connect()),
                YieldingBackend::new(self.ephemeral.connect()),
                Arc::new(self.clock.clone()),
                &self.config,
            )
        }

        /// Open `n` racing contexts.
        #[must_use]
        pub fn racing_contexts(&self, n: usize) -> Vec<Arc<RacingStore>> {
            (0..n).map(|_| Arc::new(self.racing_context())).collect()
        }

        /// Observer handle onto the durable medium.
        #[must_use]
        pub fn durable(&self) -> MemoryBackend {
            self.durable.connect()
        }

        /// Observer handle onto the shared ephemeral medium.
        #[must_use]
        pub fn ephemeral(&self) -> MemoryBackend {
            self.ephemeral.connect()
        }

        /// Clock used by every context for lease ageing.
        #[must_use]
        pub const fn clock(&self) -> &ManualClock {
            &self.clock
        }

        /// Configuration used by every context.
        #[must_use]
        pub const fn config(&self) -> &KeeperConfig {
            &self.config
        }

        fn store(&self, ephemeral: MemoryBackend) -> MemoryStore {
            AtomicTokenStore::with_clock(
                self.durable.connect(),
                ephemeral,
                Arc::new(self.clock.clone()),
                &self.config,
            )
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use session_keeper_core::Token;

    /// Opaque token strings shaped like bearer credentials.
    pub fn token_strategy() -> impl Strategy<Value = Token> {
        "[A-Za-z0-9._-]{8,48}".prop_map(Token::from)
    }

    /// A sequence of token writes: `(token, remember)` pairs.
    pub fn write_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<(Token, bool)>> {
        proptest::collection::vec((token_strategy(), any::<bool>()), 1..=max_len)
    }
}

// Re-export commonly used items
pub use helpers::{ContextHarness, MemoryStore, RacingStore, init_test_tracing};
pub use mocks::{FixedClock, ManualClock, YieldingBackend, test_clock};
