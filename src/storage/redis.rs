//! Redis-backed bucket storage.

use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::Client;
use async_trait::async_trait;
use tracing::{debug, info};

use super::{decode_bucket, encode_bucket, Store, StoreError};
use crate::ratelimit::Bucket;

/// Stores each bucket as a JSON string under `{prefix}{key}` with a
/// millisecond TTL equal to the bucket window.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str, prefix: String) -> Result<Self, StoreError> {
        info!(url = %url, prefix = %prefix, "Connecting to Redis");

        let client = Client::open(url).map_err(|e| StoreError::Connect {
            backend: "redis",
            reason: e.to_string(),
        })?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self { conn, prefix })
    }

    fn storage_key(&self, key: &str) -> String {
        prefixed_key(&self.prefix, key)
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

/// Redis rejects a zero expiry, so sub-millisecond windows round up.
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis().min(u64::MAX as u128) as u64;
    let rounded = if ttl.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    };
    rounded.max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<Vec<u8>> = ::redis::cmd("GET")
            .arg(self.storage_key(key))
            .query_async(&mut conn)
            .await?;

        raw.map(|bytes| decode_bucket(&bytes)).transpose()
    }

    async fn save(&self, key: &str, bucket: &Bucket, ttl: Duration) -> Result<(), StoreError> {
        let payload = encode_bucket(bucket)?;
        let mut conn = self.conn.clone();
        let storage_key = self.storage_key(key);

        let () = ::redis::cmd("SET")
            .arg(&storage_key)
            .arg(payload)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        debug!(key = %storage_key, ttl_ms = ttl_millis(ttl), "Saved bucket to Redis");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // DEL reports how many keys it removed; zero is still success.
        let _removed: i64 = ::redis::cmd("DEL")
            .arg(self.storage_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
