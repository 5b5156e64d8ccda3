//! Change signals for storage media shared between contexts.
//!
//! A medium that can observe writes made by other contexts publishes a
//! [`StorageChange`] for every mutation through a [`ChangeSignal`]. Each
//! context reads them through its own [`ChangeFeed`], which drops the
//! changes that context made itself.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Capacity of the broadcast channel behind a [`ChangeSignal`].
const CHANGE_CHANNEL_CAPACITY: usize = 64;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

/// Identifies the context that made a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OriginId(u64);

impl OriginId {
    /// Allocate a process-unique origin id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed))
    }
}

/// A single mutation observed on a storage medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    /// Key that was written or deleted.
    pub key: String,
    /// `true` if the key holds a value after the change, `false` if it was
    /// deleted.
    pub had_value: bool,
    /// Context that made the change.
    pub origin: OriginId,
}

/// Publishing side of a medium's change signal.
#[derive(Debug, Clone)]
pub struct ChangeSignal {
    sender: broadcast::Sender<StorageChange>,
}

impl ChangeSignal {
    /// Create a new signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish a change. Having no subscribers is not an error.
    pub fn publish(&self, change: StorageChange) {
        let _ = self.sender.send(change);
    }

    /// Open a feed for the context identified by `own_origin`.
    #[must_use]
    pub fn feed(&self, own_origin: OriginId) -> ChangeFeed {
        ChangeFeed {
            receiver: self.sender.subscribe(),
            own_origin,
        }
    }
}

impl Default for ChangeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a change signal, filtered to external changes.
#[derive(Debug)]
pub struct ChangeFeed {
    receiver: broadcast::Receiver<StorageChange>,
    own_origin: OriginId,
}

impl ChangeFeed {
    /// Wait for the next change made by another context.
    ///
    /// Returns `None` once the medium has been dropped. If the feed falls
    /// behind, missed changes are skipped and a warning is logged.
    pub async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.origin == self.own_origin => {}
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change feed lagged, skipping missed storage changes");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
