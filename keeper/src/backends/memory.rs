//! In-memory storage backend.
//!
//! A [`MemoryBackend`] is a handle onto a shared in-process medium. Handles
//! produced by [`MemoryBackend::connect`] act as separate contexts sharing
//! the same medium, the way browser tabs share local storage: each sees
//! changes made by the others through its change feed.
//!
//! Used as the ephemeral backend, and as both backends when simulating
//! multiple contexts in tests.

use session_keeper_core::backend::Result;
use session_keeper_core::{
    BackendError, ChangeFeed, ChangeSignal, OriginId, StorageBackend, StorageChange,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Handle onto a shared in-memory key-value medium.
///
/// Clones belong to the same context; use [`connect`](Self::connect) for a
/// handle acting as a different context.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    entries: Arc<RwLock<HashMap<String, String>>>,
    signal: ChangeSignal,
    origin: OriginId,
}

impl MemoryBackend {
    /// Create a new, empty medium.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            signal: ChangeSignal::new(),
            origin: OriginId::next(),
        }
    }

    /// Open another context onto the same medium.
    #[must_use]
    pub fn connect(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            signal: self.signal.clone(),
            origin: OriginId::next(),
        }
    }

    /// Number of stored keys (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        Ok(self
            .entries
            .read()
            .map_err(|_| poisoned())?
            .len())
    }

    /// Returns `true` if the medium holds no keys.
    ///
    /// # Errors
    ///
    /// Returns error if lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn publish(&self, key: &str, had_value: bool) {
        self.signal.publish(StorageChange {
            key: key.to_string(),
            had_value,
            origin: self.origin,
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> BackendError {
    BackendError::Unavailable("Memory backend lock poisoned".to_string())
}

impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let changed = {
            let mut entries = self.entries.write().map_err(|_| poisoned())?;
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if changed {
            self.publish(key, true);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let existed = {
            let mut entries = self.entries.write().map_err(|_| poisoned())?;
            entries.remove(key).is_some()
        };
        if existed {
            self.publish(key, false);
        }
        Ok(())
    }

    fn watch(&self) -> Option<ChangeFeed> {
        Some(self.signal.feed(self.origin))
    }
}
