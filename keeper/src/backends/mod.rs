//! Storage backend implementations.
//!
//! - **Memory** - In-process medium; ephemeral backend and multi-context tests
//! - **File** - JSON file; durable backend for a single host
//! - **Redis** - Durable backend shared across processes (feature `redis`)

pub mod file;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_backend;

// Re-exports
pub use file::FileBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;
