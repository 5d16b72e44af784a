//! Rate limiter trait that front ends are written against.

use std::time::Duration;

use async_trait::async_trait;

use super::limiter::LimiterError;

/// Peek, consume and reset operations on keyed buckets.
///
/// The gRPC service only depends on this trait, so it works the same
/// whichever limiter or storage backend sits behind it.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Current usage for `key`, rounded up. `NotFound` if the key has no bucket.
    async fn peek(&self, key: &str) -> Result<u64, LimiterError>;

    /// Consume `count` units against `limit` per `window` for `key`.
    async fn consume(
        &self,
        key: &str,
        count: i64,
        limit: i64,
        window: Duration,
    ) -> Result<u64, LimiterError>;

    /// Remove all state for `key`. Succeeds if there was none.
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;
}
