//! File-based durable backend.
//!
//! Entries are stored as a JSON object in a single file, so they survive a
//! process restart and are visible to every process using the same path.
//!
//! Every operation runs on the blocking pool while holding an advisory lock
//! on a sibling `.lock` file: shared for reads, exclusive for the
//! read-modify-write cycle of `set` and `delete`. Writes go to a uniquely
//! named temporary file that is renamed over the original.

use fs2::FileExt;
use serde_json::{Map, Value};
use session_keeper_core::backend::Result;
use session_keeper_core::{BackendError, StorageBackend};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Application directory name under the platform data directory.
const APP_DIR: &str = "session-keeper";

/// Default file name for durable entries.
const DURABLE_FILE: &str = "durable.json";

/// Durable backend persisting entries to a JSON file.
///
/// Handles opened on the same path, in this process or another, see each
/// other's writes and never lose one.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: Arc<PathBuf>,
}

impl FileBackend {
    /// Use the file at `path`, creating it on first write.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    /// Use the platform default location
    /// (`{data_local_dir}/session-keeper/durable.json`).
    ///
    /// # Errors
    ///
    /// Returns error if the platform has no local data directory.
    pub fn default_location() -> Result<Self> {
        let data_dir = dirs::data_local_dir().ok_or_else(|| {
            BackendError::Unavailable("Could not find local data directory".to_string())
        })?;
        Ok(Self::open(data_dir.join(APP_DIR).join(DURABLE_FILE)))
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on the blocking pool under the file lock.
    async fn locked<T, F>(&self, mode: LockMode, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
    {
        let path = Arc::clone(&self.path);
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire(path.as_path(), mode)?;
            op(path.as_path())
        })
        .await
        .map_err(|e| BackendError::Io(format!("File backend task failed: {e}")))?
    }
}

impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.locked(LockMode::Shared, move |path| {
            let entries = load(path)?;
            Ok(entries.get(&key).and_then(Value::as_str).map(str::to_string))
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.locked(LockMode::Exclusive, move |path| {
            let mut entries = load(path)?;
            entries.insert(key, Value::String(value));
            persist(path, &entries)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.locked(LockMode::Exclusive, move |path| {
            let mut entries = load(path)?;
            if entries.remove(&key).is_none() {
                return Ok(());
            }
            persist(path, &entries)
        })
        .await
    }
}

#[derive(Debug, Clone, Copy)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Advisory lock on `<path>.lock`, released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path, mode: LockMode) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BackendError::Io(format!("Failed to create {}: {e}", parent.display())))?;
        }

        let lock_path = sibling(path, ".lock");
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| BackendError::Io(format!("Failed to open {}: {e}", lock_path.display())))?;

        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked.map_err(|e| BackendError::Io(format!("Failed to lock {}: {e}", lock_path.display())))?;

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to unlock durable file");
        }
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn load(path: &Path) -> Result<Map<String, Value>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => {
            return Err(BackendError::Io(format!("Failed to read {}: {e}", path.display())));
        }
    };

    if contents.trim().is_empty() {
        return Ok(Map::new());
    }

    serde_json::from_str(&contents).map_err(|e| {
        BackendError::Serialization(format!("Failed to parse {}: {e}", path.display()))
    })
}

fn persist(path: &Path, entries: &Map<String, Value>) -> Result<()> {
    let contents = serde_json::to_string_pretty(entries)
        .map_err(|e| BackendError::Serialization(e.to_string()))?;

    let tmp_path = sibling(path, &format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp_path, contents)
        .map_err(|e| BackendError::Io(format!("Failed to write {}: {e}", tmp_path.display())))?;

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(BackendError::Io(format!("Failed to replace {}: {e}", path.display())));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("session-keeper-test-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let path = temp_path("durable.json");
        let backend = FileBackend::open(path.clone());
        assert_eq!(backend.get("auth_token").await.unwrap(), None);
        backend.delete("auth_token").await.unwrap();

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let path = temp_path("durable.json");
        let backend = FileBackend::open(path.clone());
        backend.set("auth_token", "persisted").await.unwrap();

        let reopened = FileBackend::open(path.clone());
        assert_eq!(
            reopened.get("auth_token").await.unwrap(),
            Some("persisted".to_string())
        );

        reopened.delete("auth_token").await.unwrap();
        assert_eq!(backend.get("auth_token").await.unwrap(), None);

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let path = temp_path("durable.json");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "{not json").await.unwrap();

        let backend = FileBackend::open(path.clone());
        assert!(matches!(
            backend.get("auth_token").await,
            Err(BackendError::Serialization(_))
        ));

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_handles_on_one_path_keep_every_write() {
        let path = temp_path("durable.json");
        let lease_writer = FileBackend::open(path.clone());
        let token_writer = FileBackend::open(path.clone());

        for round in 0..100 {
            let value = format!("round-{round}");
            let lease = {
                let backend = lease_writer.clone();
                let value = value.clone();
                tokio::spawn(async move { backend.set("auth_token_mutex", &value).await })
            };
            let token = {
                let backend = token_writer.clone();
                let value = value.clone();
                tokio::spawn(async move { backend.set("auth_token", &value).await })
            };
            lease.await.unwrap().unwrap();
            token.await.unwrap().unwrap();

            let reader = FileBackend::open(path.clone());
            assert_eq!(reader.get("auth_token_mutex").await.unwrap(), Some(value.clone()));
            assert_eq!(reader.get("auth_token").await.unwrap(), Some(value));
        }

        let mut leftovers = Vec::new();
        let mut dir = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            leftovers.push(entry.file_name().to_string_lossy().into_owned());
        }
        leftovers.sort();
        assert_eq!(leftovers, vec!["durable.json", "durable.json.lock"]);

        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }
}
