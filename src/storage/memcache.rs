//! Memcache-backed bucket storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{decode_bucket, encode_bucket, Store, StoreError};
use crate::ratelimit::Bucket;

/// Stores each bucket as a JSON string under `{prefix}{encoded key}`.
///
/// The memcache client is blocking, so every call runs on tokio's blocking
/// pool. Expirations are whole seconds.
#[derive(Clone)]
pub struct MemcacheStore {
    client: Arc<::memcache::Client>,
    prefix: String,
}

impl std::fmt::Debug for MemcacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl MemcacheStore {
    /// Connect to the server at `url` (e.g. `memcache://127.0.0.1:11211`).
    pub async fn connect(url: &str, prefix: String) -> Result<Self, StoreError> {
        info!(url = %url, prefix = %prefix, "Connecting to memcache");

        let url = url.to_string();
        let client = tokio::task::spawn_blocking(move || ::memcache::Client::connect(url))
            .await?
            .map_err(|e| StoreError::Connect {
                backend: "memcache",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client: Arc::new(client),
            prefix,
        })
    }

    fn storage_key(&self, key: &str) -> String {
        storage_key(&self.prefix, key)
    }
}

/// Longest key the memcached protocol accepts.
const MAX_KEY_LEN: usize = 250;

/// Expirations above this many seconds are read as absolute Unix times.
const MAX_RELATIVE_EXPIRATION: u64 = 30 * 24 * 60 * 60;

/// Map an opaque caller key onto the memcached key alphabet.
///
/// Keys are base64url encoded, so whitespace and control bytes never reach
/// the text protocol. When the result would not fit, the SHA-256 digest is
/// encoded instead behind a `#`, which base64url never produces.
fn storage_key(prefix: &str, key: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(key.as_bytes());
    if prefix.len() + encoded.len() <= MAX_KEY_LEN {
        return format!("{}{}", prefix, encoded);
    }

    let digest = Sha256::digest(key.as_bytes());
    format!("{}#{}", prefix, URL_SAFE_NO_PAD.encode(digest))
}

/// Memcache expiration for `ttl`, in whole seconds rounded up.
///
/// Zero means "never" to memcache, so the minimum is one second. TTLs past
/// thirty days are sent as an absolute Unix time.
fn expiration(ttl: Duration, now: DateTime<Utc>) -> u32 {
    let secs = (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).max(1);
    let value = if secs > MAX_RELATIVE_EXPIRATION {
        u64::try_from(now.timestamp())
            .unwrap_or(0)
            .saturating_add(secs)
    } else {
        secs
    };
    value.min(u64::from(u32::MAX)) as u32
}

#[async_trait]
impl Store for MemcacheStore {
    async fn load(&self, key: &str) -> Result<Option<Bucket>, StoreError> {
        let client = Arc::clone(&self.client);
        let storage_key = self.storage_key(key);

        let raw: Option<String> =
            tokio::task::spawn_blocking(move || client.get(&storage_key)).await??;

        raw.map(|payload| decode_bucket(payload.as_bytes())).transpose()
    }

    async fn save(&self, key: &str, bucket: &Bucket, ttl: Duration) -> Result<(), StoreError> {
        let payload = encode_bucket(bucket)?;
        let client = Arc::clone(&self.client);
        let storage_key = self.storage_key(key);
        let expiration = expiration(ttl, Utc::now());

        debug!(key = %storage_key, expiration = expiration, "Saving bucket to memcache");
        tokio::task::spawn_blocking(move || {
            client.set(&storage_key, payload.as_str(), expiration)
        })
        .await??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let client = Arc::clone(&self.client);
        let storage_key = self.storage_key(key);

        // `false` means the key was already gone.
        let _existed = tokio::task::spawn_blocking(move || client.delete(&storage_key)).await??;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memcache"
    }
}
