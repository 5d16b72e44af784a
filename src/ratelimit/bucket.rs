//! Continuous-decay token bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Returned by [`Bucket::consume`] when the request would exceed the limit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("limit reached")]
pub struct LimitExceeded;

/// Consumption state for one key and the policy it was last consumed under.
///
/// Usage leaks linearly: a bucket at `limit` drains to zero after one full
/// `window` without traffic. After any successful mutation
/// `0 <= used <= limit` holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    /// Tokens consumed, fractional
    used: f64,
    /// Time of the last successful mutation, `None` if never touched
    last_access: Option<DateTime<Utc>>,
    /// Ceiling on `used`
    limit: f64,
    /// Span over which `limit` tokens regenerate
    window: Duration,
}

impl Bucket {
    /// Create an untouched bucket for the given policy.
    pub fn new(limit: f64, window: Duration) -> Self {
        Self {
            used: 0.0,
            last_access: None,
            limit,
            window,
        }
    }

    /// Rebuild a bucket from previously persisted fields.
    pub fn from_parts(
        used: f64,
        last_access: Option<DateTime<Utc>>,
        limit: f64,
        window: Duration,
    ) -> Self {
        Self {
            used,
            last_access,
            limit,
            window,
        }
    }

    /// Stored usage, without decay applied.
    pub fn used(&self) -> f64 {
        self.used
    }

    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.last_access
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Usage as of `now`, after decay. Never negative, never mutates.
    pub fn adjusted_usage(&self, now: DateTime<Utc>) -> f64 {
        let Some(last_access) = self.last_access else {
            return self.used;
        };
        if self.window.is_zero() {
            return self.used;
        }

        // A clock that stepped backwards counts as no time elapsed.
        let elapsed = (now - last_access).to_std().unwrap_or(Duration::ZERO);
        let decayed =
            self.used - self.limit * elapsed.as_secs_f64() / self.window.as_secs_f64();
        decayed.max(0.0)
    }

    /// Try to consume `count` tokens under the policy `(limit, window)`.
    ///
    /// A zero `window` disables enforcement and leaves the bucket untouched.
    /// A policy that differs from the stored one starts a fresh window.
    /// On failure the stored usage is left as it was before the call.
    pub fn consume(
        &mut self,
        count: f64,
        limit: f64,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<f64, LimitExceeded> {
        if window.is_zero() {
            return Ok(self.used);
        }

        if self.limit != limit || self.window != window {
            self.used = 0.0;
            self.last_access = Some(now);
            self.limit = limit;
            self.window = window;
        }

        let adjusted = self.adjusted_usage(now);
        if adjusted + count <= self.limit {
            self.used = adjusted + count;
            self.last_access = Some(now);
            Ok(self.used)
        } else {
            Err(LimitExceeded)
        }
    }
}

/// Round a fractional usage up to the caller-visible whole unit.
pub fn whole_units(used: f64) -> u64 {
    used.max(0.0).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const WINDOW: Duration = Duration::from_secs(100);

    #[test]
    fn test_new_bucket_is_empty() {
        let bucket = Bucket::new(10.0, WINDOW);
        assert_eq!(bucket.used(), 0.0);
        assert!(bucket.last_access().is_none());
        assert_eq!(bucket.adjusted_usage(Utc::now()), 0.0);
    }

    #[test]
    fn test_consume_within_limit() {
        let now = Utc::now();
        let mut bucket = Bucket::new(10.0, WINDOW);

        assert_eq!(bucket.consume(1.0, 10.0, WINDOW, now), Ok(1.0));
        assert_eq!(bucket.consume(4.0, 10.0, WINDOW, now), Ok(5.0));
        assert_eq!(bucket.last_access(), Some(now));
    }

    #[test]
    fn test_consume_never_exceeds_limit() {
        let now = Utc::now();
        let mut bucket = Bucket::new(10.0, WINDOW);

        for i in 0..20 {
            let _ = bucket.consume(1.0, 10.0, WINDOW, now + TimeDelta::milliseconds(i));
            assert!(bucket.used() <= bucket.limit());
            assert!(bucket.used() >= 0.0);
        }
    }

    #[test]
    fn test_decay_after_half_window() {
        let now = Utc::now();
        let bucket = Bucket::from_parts(10.0, Some(now - TimeDelta::seconds(50)), 10.0, WINDOW);

        assert_eq!(bucket.adjusted_usage(now), 5.0);

        let mut bucket = bucket;
        assert_eq!(bucket.consume(1.0, 10.0, WINDOW, now), Ok(6.0));
        assert_eq!(whole_units(bucket.used()), 6);
    }

    #[test]
    fn test_decay_floors_at_zero() {
        let now = Utc::now();
        let bucket = Bucket::from_parts(3.0, Some(now - TimeDelta::seconds(500)), 10.0, WINDOW);
        assert_eq!(bucket.adjusted_usage(now), 0.0);
    }

    #[test]
    fn test_backwards_clock_does_not_decay() {
        let now = Utc::now();
        let bucket = Bucket::from_parts(4.0, Some(now + TimeDelta::seconds(30)), 10.0, WINDOW);
        assert_eq!(bucket.adjusted_usage(now), 4.0);
    }

    #[test]
    fn test_zero_window_is_a_bypass() {
        let now = Utc::now();
        let mut bucket = Bucket::from_parts(7.0, Some(now), 10.0, WINDOW);

        assert_eq!(bucket.consume(100.0, 10.0, Duration::ZERO, now), Ok(7.0));
        assert_eq!(bucket.used(), 7.0);
        assert_eq!(bucket.window(), WINDOW);
    }

    #[test]
    fn test_policy_change_resets_usage() {
        let now = Utc::now();
        let mut bucket = Bucket::new(10.0, WINDOW);
        bucket.consume(8.0, 10.0, WINDOW, now).unwrap();

        let short = Duration::from_secs(50);
        assert_eq!(bucket.consume(1.0, 5.0, short, now), Ok(1.0));
        assert_eq!(bucket.limit(), 5.0);
        assert_eq!(bucket.window(), short);
    }

    #[test]
    fn test_exceeded_leaves_stored_usage() {
        let now = Utc::now();
        let earlier = now - TimeDelta::seconds(5);
        let mut bucket = Bucket::from_parts(10.0, Some(earlier), 10.0, WINDOW);

        // 5s of decay frees half a token, not enough for one more.
        assert_eq!(bucket.consume(1.0, 10.0, WINDOW, now), Err(LimitExceeded));
        assert_eq!(bucket.used(), 10.0);
        assert_eq!(bucket.last_access(), Some(earlier));
    }

    #[test]
    fn test_zero_count_follows_normal_path() {
        let now = Utc::now();
        let mut bucket = Bucket::from_parts(10.0, Some(now), 10.0, WINDOW);
        assert_eq!(bucket.consume(0.0, 10.0, WINDOW, now), Ok(10.0));
    }

    #[test]
    fn test_whole_units_rounds_up() {
        assert_eq!(whole_units(0.0), 0);
        assert_eq!(whole_units(4.0001), 5);
        assert_eq!(whole_units(5.0), 5);
    }
}
