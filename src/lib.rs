//! Ratelimitd - Sliding-Window Rate Limiting Service
//!
//! Enforces "at most `limit` units per `window`" against arbitrary keys.
//! Bucket state lives either in process memory or in a shared Redis or
//! memcache server, so several instances can enforce the same limits. All
//! mutations for one limiter go through a single worker task.

pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod storage;
