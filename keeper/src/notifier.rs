//! Change notifier.
//!
//! Relays changes made to either backend by *other* contexts to local
//! subscribers. Changes made by this context are never echoed back.

use session_keeper_core::{BackendKind, ChangeFeed, StorageBackend};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Subscriber channel capacity.
const CHANNEL_CAPACITY: usize = 32;

/// A change observed in one backend, made by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChange {
    /// Backend the change happened in.
    pub backend: BackendKind,
    /// Key that changed.
    pub key: String,
    /// `true` if the key holds a value after the change.
    pub had_value: bool,
}

/// Relays backend change feeds to subscribers.
///
/// Dropping the notifier stops the relay tasks and closes every
/// subscription.
pub struct ChangeNotifier {
    sender: broadcast::Sender<ExternalChange>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChangeNotifier {
    /// Start relaying from both backends.
    ///
    /// Backends without a change feed are skipped. Must be called from
    /// within a Tokio runtime.
    #[must_use]
    pub fn spawn<D: StorageBackend, E: StorageBackend>(durable: &D, ephemeral: &E) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut tasks = Vec::with_capacity(2);

        for (backend, feed) in [
            (BackendKind::Durable, durable.watch()),
            (BackendKind::Ephemeral, ephemeral.watch()),
        ] {
            match feed {
                Some(feed) => tasks.push(tokio::spawn(relay(backend, feed, sender.clone()))),
                None => tracing::debug!(
                    backend = backend.as_str(),
                    "Backend has no change feed, not watching"
                ),
            }
        }

        Self { sender, tasks }
    }

    /// Subscribe to external changes. Dropping the subscription unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of backends being watched.
    #[must_use]
    pub fn watched_backends(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }

    /// Stop relaying. Existing subscriptions see no further changes.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChangeNotifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn relay(backend: BackendKind, mut feed: ChangeFeed, sender: broadcast::Sender<ExternalChange>) {
    while let Some(change) = feed.next().await {
        tracing::debug!(
            backend = backend.as_str(),
            key = %change.key,
            had_value = change.had_value,
            "External storage change"
        );
        // No subscribers is not an error.
        let _ = sender.send(ExternalChange {
            backend,
            key: change.key,
            had_value: change.had_value,
        });
    }
    tracing::debug!(backend = backend.as_str(), "Change feed closed");
}

/// Handle for receiving [`ExternalChange`]s.
pub struct Subscription {
    receiver: broadcast::Receiver<ExternalChange>,
}

impl Subscription {
    /// Wait for the next change.
    ///
    /// Returns `None` once the notifier is gone. Changes missed by a slow
    /// subscriber are skipped with a warning.
    pub async fn recv(&mut self) -> Option<ExternalChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next change if one is already queued.
    pub fn try_recv(&mut self) -> Option<ExternalChange> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Change subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving changes.
    pub fn unsubscribe(self) {}
}
