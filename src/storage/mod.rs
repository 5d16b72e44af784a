//! Pluggable persistence for bucket state.
//!
//! The limiter worker is the only writer, so backends do not need any
//! read-modify-write atomicity of their own. They only need to make each
//! individual `save` atomic.

mod memcache;
mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::StorageConfig;
use crate::ratelimit::Bucket;

pub use self::memcache::MemcacheStore;
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to encode bucket: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode bucket: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("memcache error: {0}")]
    Memcache(#[from] ::memcache::MemcacheError),

    /// A blocking backend call panicked or was cancelled
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("failed to connect to {backend}: {reason}")]
    Connect { backend: &'static str, reason: String },
}

/// Where bucket state physically lives.
///
/// `load` reports a missing or expired key as `Ok(None)`. `delete` succeeds
/// when the key is already gone. `ttl` is a hint: remote backends expire the
/// entry after it, the in-memory backend ignores it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Bucket>, StoreError>;

    async fn save(&self, key: &str, bucket: &Bucket, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Encode a bucket for a remote backend.
pub(crate) fn encode_bucket(bucket: &Bucket) -> Result<String, StoreError> {
    serde_json::to_string(bucket).map_err(StoreError::Encode)
}

/// Decode a bucket previously written by [`encode_bucket`].
pub(crate) fn decode_bucket(raw: &[u8]) -> Result<Bucket, StoreError> {
    serde_json::from_slice(raw).map_err(StoreError::Decode)
}

/// Open the backend selected by configuration.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match config {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Redis { url, key_prefix } => {
            Arc::new(RedisStore::connect(url, key_prefix.clone()).await?)
        }
        StorageConfig::Memcache { url, key_prefix } => {
            Arc::new(MemcacheStore::connect(url, key_prefix.clone()).await?)
        }
    };

    info!(backend = store.name(), "Storage backend ready");
    Ok(store)
}
