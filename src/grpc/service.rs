//! Rate limit service implementation.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::proto::{
    rate_limit_service_server::RateLimitService, ConsumeRequest, PeekRequest, ResetRequest,
    ResetResponse, UsageResponse,
};
use crate::ratelimit::{LimiterError, RateLimiterBackend};

/// Implementation of the `ratelimitd.v1.RateLimitService` gRPC interface.
pub struct RateLimitServiceImpl<R: RateLimiterBackend> {
    /// The rate limiter instance
    rate_limiter: Arc<R>,
}

impl<R: RateLimiterBackend> RateLimitServiceImpl<R> {
    /// Create a new RateLimitServiceImpl with the given rate limiter.
    pub fn new(rate_limiter: Arc<R>) -> Self {
        Self { rate_limiter }
    }
}

fn required_key(key: &str) -> Result<&str, Status> {
    if key.is_empty() {
        return Err(Status::invalid_argument("'key' field is missing"));
    }
    Ok(key)
}

fn required_window(window: Option<prost_types::Duration>) -> Result<Duration, Status> {
    let window = window.ok_or_else(|| Status::invalid_argument("'window' field is missing"))?;
    Duration::try_from(window)
        .map_err(|_| Status::invalid_argument("'window' is not a valid duration value"))
}

/// Map a limiter outcome to the status a client sees.
///
/// Policy denials and unknown keys are client-visible outcomes, distinct
/// from server-side failures.
fn to_status(err: LimiterError) -> Status {
    match err {
        LimiterError::Validation(e) => Status::invalid_argument(e.to_string()),
        LimiterError::NotFound => Status::not_found("key not found"),
        LimiterError::LimitExceeded { .. } => Status::resource_exhausted("limit reached"),
        LimiterError::NotRunning | LimiterError::Stopped | LimiterError::AlreadyStarted => {
            Status::unavailable(err.to_string())
        }
        LimiterError::Store(e) => Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl<R: RateLimiterBackend + 'static> RateLimitService for RateLimitServiceImpl<R> {
    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn peek(
        &self,
        request: Request<PeekRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();
        let key = required_key(&req.key).inspect_err(|_| warn!("Peek without key"))?;

        match self.rate_limiter.peek(key).await {
            Ok(used) => {
                debug!(used, "Peek ok");
                Ok(Response::new(UsageResponse { used }))
            }
            Err(e) => {
                let status = to_status(e);
                debug!(code = ?status.code(), "Peek failed");
                Err(status)
            }
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            key = %request.get_ref().key,
            count = request.get_ref().count,
            limit = request.get_ref().limit
        )
    )]
    async fn consume(
        &self,
        request: Request<ConsumeRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();
        let key = required_key(&req.key).inspect_err(|_| warn!("Consume without key"))?;
        let window = required_window(req.window)
            .inspect_err(|s| warn!(reason = %s.message(), "Consume with bad window"))?;

        match self
            .rate_limiter
            .consume(key, req.count, req.limit, window)
            .await
        {
            Ok(used) => {
                info!(window = ?window, used, "Consume admitted");
                Ok(Response::new(UsageResponse { used }))
            }
            Err(e) => {
                let status = to_status(e);
                info!(window = ?window, code = ?status.code(), "Consume rejected");
                Err(status)
            }
        }
    }

    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn reset(
        &self,
        request: Request<ResetRequest>,
    ) -> Result<Response<ResetResponse>, Status> {
        let req = request.into_inner();
        let key = required_key(&req.key).inspect_err(|_| warn!("Reset without key"))?;

        self.rate_limiter.reset(key).await.map_err(to_status)?;
        info!("Reset");
        Ok(Response::new(ResetResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimiter;
    use crate::storage::{MemoryStore, StoreError};
    use async_trait::async_trait;

    fn started_service() -> RateLimitServiceImpl<RateLimiter> {
        let rate_limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        rate_limiter.start().unwrap();
        RateLimitServiceImpl::new(Arc::new(rate_limiter))
    }

    fn consume_request(key: &str, count: i64, limit: i64, secs: i64) -> Request<ConsumeRequest> {
        Request::new(ConsumeRequest {
            key: key.to_string(),
            count,
            limit,
            window: Some(prost_types::Duration {
                seconds: secs,
                nanos: 0,
            }),
        })
    }

    /// Backend whose storage is always down.
    struct BrokenBackend;

    #[async_trait]
    impl RateLimiterBackend for BrokenBackend {
        async fn peek(&self, _key: &str) -> Result<u64, LimiterError> {
            Err(LimiterError::Store(StoreError::Connect {
                backend: "redis",
                reason: "connection refused".to_string(),
            }))
        }

        async fn consume(
            &self,
            _key: &str,
            _count: i64,
            _limit: i64,
            _window: Duration,
        ) -> Result<u64, LimiterError> {
            Err(LimiterError::Store(StoreError::Connect {
                backend: "redis",
                reason: "connection refused".to_string(),
            }))
        }

        async fn reset(&self, _key: &str) -> Result<(), LimiterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_consume_returns_usage() {
        let service = started_service();

        let response = service
            .consume(consume_request("testkey1", 1, 10, 100))
            .await
            .unwrap();
        assert_eq!(response.into_inner().used, 1);
    }

    #[tokio::test]
    async fn test_consume_missing_window_rejected() {
        let service = started_service();

        let request = Request::new(ConsumeRequest {
            key: "testkey1".to_string(),
            count: 1,
            limit: 10,
            window: None,
        });

        let status = service.consume(request).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "'window' field is missing");
    }

    #[tokio::test]
    async fn test_consume_negative_window_rejected() {
        let service = started_service();

        let status = service
            .consume(consume_request("testkey1", 1, 10, -5))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "'window' is not a valid duration value");
    }

    #[tokio::test]
    async fn test_consume_missing_key_rejected() {
        let service = started_service();

        let status = service
            .consume(consume_request("", 1, 10, 100))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "'key' field is missing");
    }

    #[tokio::test]
    async fn test_consume_validation_is_client_error() {
        let service = started_service();

        let status = service
            .consume(consume_request("testkey1", 0, 10, 100))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .consume(consume_request("testkey1", 11, 10, 100))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "Limit should be greater than count");
    }

    #[tokio::test]
    async fn test_limit_reached_is_resource_exhausted() {
        let service = started_service();

        service
            .consume(consume_request("testkey1", 1, 1, 100))
            .await
            .unwrap();
        let status = service
            .consume(consume_request("testkey1", 1, 1, 100))
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::ResourceExhausted);
        assert_eq!(status.message(), "limit reached");
    }

    #[tokio::test]
    async fn test_peek_unknown_key_is_not_found() {
        let service = started_service();

        let status = service
            .peek(Request::new(PeekRequest {
                key: "nobody".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_peek_after_consume() {
        let service = started_service();
        service
            .consume(consume_request("testkey1", 3, 10, 100))
            .await
            .unwrap();

        let response = service
            .peek(Request::new(PeekRequest {
                key: "testkey1".to_string(),
            }))
            .await
            .unwrap();
        assert_eq!(response.into_inner().used, 3);
    }

    #[tokio::test]
    async fn test_reset_then_peek() {
        let service = started_service();
        service
            .consume(consume_request("testkey1", 1, 10, 100))
            .await
            .unwrap();

        service
            .reset(Request::new(ResetRequest {
                key: "testkey1".to_string(),
            }))
            .await
            .unwrap();

        let status = service
            .peek(Request::new(PeekRequest {
                key: "testkey1".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_reset_missing_key_rejected() {
        let service = started_service();

        let status = service
            .reset(Request::new(ResetRequest { key: String::new() }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_store_fault_is_internal() {
        let service = RateLimitServiceImpl::new(Arc::new(BrokenBackend));

        let status = service
            .consume(consume_request("testkey1", 1, 10, 100))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);

        let status = service
            .peek(Request::new(PeekRequest {
                key: "testkey1".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn test_stopped_limiter_is_unavailable() {
        let rate_limiter = Arc::new(RateLimiter::new(Arc::new(MemoryStore::new())));
        rate_limiter.start().unwrap();
        rate_limiter.stop().await;
        let service = RateLimitServiceImpl::new(rate_limiter);

        let status = service
            .consume(consume_request("testkey1", 1, 10, 100))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
