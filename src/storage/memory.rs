//! Process-local bucket storage.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Store, StoreError};
use crate::ratelimit::Bucket;

/// Bucket storage in a concurrent map.
///
/// Entries never expire on their own; they are removed only by `delete`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Bucket>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.buckets.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &str, bucket: &Bucket, _ttl: Duration) -> Result<(), StoreError> {
        self.buckets.insert(key.to_string(), bucket.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.buckets.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
