//! Rate limiting logic and state management.

mod backend;
mod bucket;
mod limiter;

pub use backend::RateLimiterBackend;
pub use bucket::{whole_units, Bucket, LimitExceeded};
pub use limiter::{
    validate_consume, LimiterError, RateLimiter, ValidationError, WorkerState,
    DEFAULT_QUEUE_CAPACITY,
};
