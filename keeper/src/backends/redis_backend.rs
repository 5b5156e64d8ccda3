//! Redis-based durable backend.
//!
//! Lets token stores in separate processes (or hosts) share one durable
//! medium, including the mutex lease.
//!
//! # Architecture
//!
//! Keys are stored as plain strings under a namespace prefix:
//! - **Token**: `{namespace}:auth_token`
//! - **Lease**: `{namespace}:auth_token_mutex`
//!
//! No TTL is set on either key; lease expiry is judged from the stored
//! timestamp so that every backend behaves the same way.
//!
//! # Example
//!
//! ```no_run
//! use session_keeper::backends::RedisBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let durable = RedisBackend::new("redis://127.0.0.1:6379", "app:user-42").await?;
//! # Ok(())
//! # }
//! ```

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use session_keeper_core::backend::Result;
use session_keeper_core::{BackendError, StorageBackend};

/// Durable backend stored in Redis.
///
/// This type is `Clone`; clones share the same `ConnectionManager`.
#[derive(Clone)]
pub struct RedisBackend {
    conn_manager: ConnectionManager,
    namespace: String,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    /// * `namespace` - Prefix isolating this store's keys
    ///
    /// # Errors
    ///
    /// Returns error if the URL is malformed or the connection fails.
    pub async fn new(redis_url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            BackendError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            BackendError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        let namespace = namespace.into();
        tracing::info!(namespace = %namespace, "RedisBackend initialized successfully");

        Ok(Self {
            conn_manager,
            namespace,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }
}

impl StorageBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get(self.namespaced(key))
            .await
            .map_err(|e| BackendError::Io(format!("Failed to get {key} from Redis: {e}")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        conn.set(self.namespaced(key), value)
            .await
            .map_err(|e| BackendError::Io(format!("Failed to set {key} in Redis: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        conn.del(self.namespaced(key))
            .await
            .map_err(|e| BackendError::Io(format!("Failed to delete {key} from Redis: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // Run with: docker run -d -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_redis_backend_lifecycle() {
        let namespace = format!("session-keeper-test:{}", uuid::Uuid::new_v4());
        let backend = RedisBackend::new("redis://127.0.0.1:6379", namespace)
            .await
            .unwrap();

        assert_eq!(backend.get("auth_token").await.unwrap(), None);

        backend.set("auth_token", "tok").await.unwrap();
        assert_eq!(
            backend.get("auth_token").await.unwrap(),
            Some("tok".to_string())
        );

        backend.delete("auth_token").await.unwrap();
        assert_eq!(backend.get("auth_token").await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_namespaces_are_isolated() {
        let a = RedisBackend::new("redis://127.0.0.1:6379", format!("ns-a:{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();
        let b = RedisBackend::new("redis://127.0.0.1:6379", format!("ns-b:{}", uuid::Uuid::new_v4()))
            .await
            .unwrap();

        a.set("auth_token", "only-in-a").await.unwrap();
        assert_eq!(b.get("auth_token").await.unwrap(), None);
        a.delete("auth_token").await.unwrap();
    }
}
