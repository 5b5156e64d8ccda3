//! Fault-injecting backend wrapper.

use session_keeper_core::backend::Result;
use session_keeper_core::{BackendError, ChangeFeed, StorageBackend};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Faults {
    fail_gets: AtomicBool,
    fail_sets: AtomicBool,
    fail_deletes: AtomicBool,
    dropped_keys: Mutex<HashSet<String>>,
}

/// Wraps a backend and injects failures on demand.
///
/// Clones share the same fault switches, so a test can keep a handle and
/// flip faults while the store owns another.
#[derive(Debug, Clone)]
pub struct FlakyBackend<B> {
    inner: B,
    faults: Arc<Faults>,
}

impl<B: StorageBackend> FlakyBackend<B> {
    /// Wrap `inner` with every fault switched off.
    #[must_use]
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Wrapped backend.
    pub const fn inner(&self) -> &B {
        &self.inner
    }

    /// Make every `get` fail.
    pub fn fail_gets(&self, fail: bool) {
        self.faults.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Make every `set` fail.
    pub fn fail_sets(&self, fail: bool) {
        self.faults.fail_sets.store(fail, Ordering::SeqCst);
    }

    /// Make every `delete` fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.faults.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make every operation fail.
    pub fn fail_all(&self, fail: bool) {
        self.fail_gets(fail);
        self.fail_sets(fail);
        self.fail_deletes(fail);
    }

    /// Report success for writes to `key` without performing them.
    pub fn drop_writes_to(&self, key: &str) {
        if let Ok(mut keys) = self.faults.dropped_keys.lock() {
            keys.insert(key.to_string());
        }
    }

    fn injected(operation: &str) -> BackendError {
        BackendError::Unavailable(format!("injected {operation} failure"))
    }

    fn drops(&self, key: &str) -> bool {
        self.faults
            .dropped_keys
            .lock()
            .is_ok_and(|keys| keys.contains(key))
    }
}

impl<B: StorageBackend> StorageBackend for FlakyBackend<B> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.faults.fail_gets.load(Ordering::SeqCst) {
            return Err(Self::injected("get"));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.faults.fail_sets.load(Ordering::SeqCst) {
            return Err(Self::injected("set"));
        }
        if self.drops(key) {
            return Ok(());
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.faults.fail_deletes.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(key).await
    }

    fn watch(&self) -> Option<ChangeFeed> {
        self.inner.watch()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    #[tokio::test]
    async fn test_faults_are_shared_between_clones() {
        let backend = FlakyBackend::new(MemoryBackend::new());
        let handle = backend.clone();

        handle.fail_sets(true);
        assert!(backend.set("k", "v").await.is_err());

        handle.fail_sets(false);
        backend.set("k", "v").await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_writes_report_success() {
        let backend = FlakyBackend::new(MemoryBackend::new());
        backend.drop_writes_to("k");

        backend.set("k", "v").await.unwrap();
        backend.set("other", "v").await.unwrap();

        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(backend.get("other").await.unwrap().is_some());
    }
}
