//! Core rate limiter implementation.
//!
//! All bucket state is owned by a single worker task. Callers send a request
//! carrying a fresh oneshot reply channel and wait for the answer, so every
//! load, decay/consume and save for a request finishes before the next
//! request is looked at. Two concurrent consumes on one key can therefore
//! never both observe the same stored usage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::backend::RateLimiterBackend;
use super::bucket::{whole_units, Bucket, LimitExceeded};
use crate::storage::{Store, StoreError};

/// Default capacity of the worker's inbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Rejected consume arguments. Raised before the request reaches the worker.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Key cannot be empty")]
    EmptyKey,
    #[error("Count should be greater than zero")]
    NonPositiveCount,
    #[error("Limit should be greater than zero")]
    NonPositiveLimit,
    #[error("Limit should be greater than count")]
    CountExceedsLimit,
    #[error("Duration cannot be zero")]
    NonPositiveWindow,
}

/// Errors returned by limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No bucket is stored for the key
    #[error("key not found")]
    NotFound,

    /// Consume denied by policy; `used` is the stored usage, unchanged
    #[error("limit reached")]
    LimitExceeded { used: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("rate limiter worker is not running")]
    NotRunning,

    #[error("rate limiter has been stopped")]
    Stopped,

    #[error("rate limiter worker already started")]
    AlreadyStarted,
}

/// Lifecycle of the limiter's worker. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopped,
}

type Reply<T> = oneshot::Sender<Result<T, LimiterError>>;

enum Command {
    Peek {
        key: String,
        reply: Reply<u64>,
    },
    Consume {
        key: String,
        count: f64,
        limit: f64,
        window: Duration,
        reply: Reply<u64>,
    },
    Reset {
        key: String,
        reply: Reply<()>,
    },
    Stop,
}

struct Lifecycle {
    state: WorkerState,
    /// Held until `start` hands it to the worker
    inbox: Option<mpsc::Receiver<Command>>,
    worker: Option<JoinHandle<()>>,
}

/// The serializing rate limiter.
///
/// Construct it, call [`RateLimiter::start`] from inside a tokio runtime,
/// then share it (typically behind an `Arc`) with any number of callers.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    sender: mpsc::Sender<Command>,
    lifecycle: Mutex<Lifecycle>,
}

impl RateLimiter {
    /// Create a limiter over `store` with the default queue capacity.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_capacity(store, DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a limiter whose inbound queue holds up to `capacity` requests.
    pub fn with_capacity(store: Arc<dyn Store>, capacity: usize) -> Self {
        let (sender, inbox) = mpsc::channel(capacity.max(1));
        Self {
            store,
            sender,
            lifecycle: Mutex::new(Lifecycle {
                state: WorkerState::Idle,
                inbox: Some(inbox),
                worker: None,
            }),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.lock().state
    }

    /// Spawn the worker. Must be called within a tokio runtime.
    pub fn start(&self) -> Result<(), LimiterError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            WorkerState::Running => return Err(LimiterError::AlreadyStarted),
            WorkerState::Stopped => return Err(LimiterError::Stopped),
            WorkerState::Idle => {}
        }

        let inbox = lifecycle.inbox.take().ok_or(LimiterError::Stopped)?;
        let worker = Worker {
            store: Arc::clone(&self.store),
            inbox,
        };
        lifecycle.worker = Some(tokio::spawn(worker.run()));
        lifecycle.state = WorkerState::Running;

        info!(backend = self.store.name(), "Rate limiter worker started");
        Ok(())
    }

    /// Stop the worker after everything already queued has been answered.
    ///
    /// Requests that arrive afterwards fail with [`LimiterError::Stopped`].
    /// There is no way back to `Running`.
    pub async fn stop(&self) {
        let worker = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = std::mem::replace(&mut lifecycle.state, WorkerState::Stopped);
            lifecycle.inbox = None;
            if previous != WorkerState::Running {
                return;
            }
            lifecycle.worker.take()
        };

        if self.sender.send(Command::Stop).await.is_err() {
            debug!("Rate limiter worker already gone");
        }

        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rate limiter worker terminated abnormally");
            }
        }

        info!("Rate limiter stopped");
    }

    /// Current usage for `key`, rounded up, without mutating it.
    pub async fn peek(&self, key: &str) -> Result<u64, LimiterError> {
        self.request(|reply| Command::Peek {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Consume `count` units for `key` under `limit` per `window`.
    ///
    /// Arguments are validated before anything is queued.
    pub async fn consume(
        &self,
        key: &str,
        count: i64,
        limit: i64,
        window: Duration,
    ) -> Result<u64, LimiterError> {
        validate_consume(key, count, limit, window)?;

        self.request(|reply| Command::Consume {
            key: key.to_string(),
            count: count as f64,
            limit: limit as f64,
            window,
            reply,
        })
        .await
    }

    /// Remove the bucket for `key`. Idempotent.
    pub async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.request(|reply| Command::Reset {
            key: key.to_string(),
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, LimiterError> {
        self.ensure_running()?;

        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| LimiterError::Stopped)?;

        // The worker drops queued replies when it exits after a stop.
        response.await.map_err(|_| LimiterError::Stopped)?
    }

    fn ensure_running(&self) -> Result<(), LimiterError> {
        match self.state() {
            WorkerState::Running => Ok(()),
            WorkerState::Idle => Err(LimiterError::NotRunning),
            WorkerState::Stopped => Err(LimiterError::Stopped),
        }
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn peek(&self, key: &str) -> Result<u64, LimiterError> {
        self.peek(key).await
    }

    async fn consume(
        &self,
        key: &str,
        count: i64,
        limit: i64,
        window: Duration,
    ) -> Result<u64, LimiterError> {
        self.consume(key, count, limit, window).await
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.reset(key).await
    }
}

/// Check consume arguments.
pub fn validate_consume(
    key: &str,
    count: i64,
    limit: i64,
    window: Duration,
) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if count <= 0 {
        return Err(ValidationError::NonPositiveCount);
    }
    if limit <= 0 {
        return Err(ValidationError::NonPositiveLimit);
    }
    if count > limit {
        return Err(ValidationError::CountExceedsLimit);
    }
    if window.is_zero() {
        return Err(ValidationError::NonPositiveWindow);
    }
    Ok(())
}

/// Sole reader and writer of bucket state.
struct Worker {
    store: Arc<dyn Store>,
    inbox: mpsc::Receiver<Command>,
}

impl Worker {
    async fn run(mut self) {
        debug!("Rate limiter worker accepting requests");

        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Peek { key, reply } => {
                    trace!(key = %key, "Peek");
                    let result = self.peek(&key).await;
                    log_store_fault(&key, &result);
                    let _ = reply.send(result);
                }
                Command::Consume {
                    key,
                    count,
                    limit,
                    window,
                    reply,
                } => {
                    trace!(key = %key, count, limit, window = ?window, "Consume");
                    let result = self.consume(&key, count, limit, window).await;
                    log_store_fault(&key, &result);
                    let _ = reply.send(result);
                }
                Command::Reset { key, reply } => {
                    trace!(key = %key, "Reset");
                    let result = self.reset(&key).await;
                    log_store_fault(&key, &result);
                    let _ = reply.send(result);
                }
                Command::Stop => break,
            }
        }

        debug!("Rate limiter worker exiting");
    }

    async fn peek(&self, key: &str) -> Result<u64, LimiterError> {
        let bucket = self.store.load(key).await?.ok_or(LimiterError::NotFound)?;
        Ok(whole_units(bucket.adjusted_usage(Utc::now())))
    }

    async fn consume(
        &self,
        key: &str,
        count: f64,
        limit: f64,
        window: Duration,
    ) -> Result<u64, LimiterError> {
        let now = Utc::now();
        let mut bucket = self
            .store
            .load(key)
            .await?
            .unwrap_or_else(|| Bucket::new(limit, window));

        match bucket.consume(count, limit, window, now) {
            Ok(used) => {
                self.store.save(key, &bucket, window).await?;
                Ok(whole_units(used))
            }
            Err(LimitExceeded) => {
                let used = whole_units(bucket.used());
                debug!(key = %key, used, limit, "Rate limit exceeded");
                Err(LimiterError::LimitExceeded { used })
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.store.delete(key).await?;
        Ok(())
    }
}

fn log_store_fault<T>(key: &str, result: &Result<T, LimiterError>) {
    if let Err(LimiterError::Store(e)) = result {
        warn!(key = %key, error = %e, "Storage backend failed");
    }
}
