//! # Session Keeper
//!
//! Client-side session credential store and session lifecycle controller.
//!
//! ## Features
//!
//! - **Atomic**: The token lives in exactly one of two backends, verified
//!   after every write
//! - **Coordinated**: Contexts sharing the durable backend serialize writes
//!   through a lease with stale-holder takeover
//! - **Expiring**: Sessions end after a configurable period of inactivity
//! - **Observable**: Changes made by other contexts are relayed to
//!   subscribers
//!
//! ## Architecture
//!
//! ```text
//! SessionController ──► AtomicTokenStore ──► LeaseMutex ──► Durable backend
//!        │                     │
//!        │                     └───────────────────────────► Ephemeral backend
//!        ├──► ConsistencyVerifier
//!        ├──► SessionAuthority (server)
//!        └──◄ ChangeNotifier ◄── backend change feeds
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use session_keeper::*;
//!
//! let config = KeeperConfig::from_env()?;
//! let store = Arc::new(AtomicTokenStore::new(
//!     FileBackend::default_location()?,
//!     MemoryBackend::new(),
//!     &config,
//! ));
//! store.init().await?;
//!
//! let controller = SessionController::restore(store, authority, config.clone()).await;
//! controller.begin_session(token, true, config.session_timeout).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Public modules
pub mod backends;
pub mod config;
pub mod constants;
pub mod controller;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod mutex;
pub mod notifier;
pub mod providers;
pub mod store;
pub mod verifier;

// Mock implementations for testing
#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use backends::{FileBackend, MemoryBackend};
pub use config::{KeeperConfig, Profile};
pub use controller::{SessionController, SessionEvent};
pub use error::{AcquireError, ConfigError, Result, SessionError, StoreError};
pub use mutex::{LeaseGuard, LeaseMutex};
pub use notifier::{ChangeNotifier, ExternalChange, Subscription};
pub use providers::{AuthorityError, SessionAuthority, SessionOwner};
pub use store::AtomicTokenStore;
pub use verifier::{ConsistencyReport, ConsistencyVerifier, IssueKind};

pub use session_keeper_core::{BackendError, BackendKind, StorageBackend, StorageMode, Token};
