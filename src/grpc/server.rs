//! gRPC server implementation.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use super::proto::rate_limit_service_server::RateLimitServiceServer;
use super::service::RateLimitServiceImpl;
use crate::error::{RatelimitdError, Result};
use crate::ratelimit::RateLimiterBackend;

/// gRPC server for the rate limit service.
pub struct GrpcServer<R: RateLimiterBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<R>,
}

impl<R: RateLimiterBackend + 'static> GrpcServer<R> {
    /// Create a new gRPC server in front of a rate limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<R>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Start the gRPC server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_with_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    ///
    /// Useful when binding to port 0 and reading the chosen port back.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let service = RateLimitServiceImpl::new(self.rate_limiter);

        info!(
            addr = %listener.local_addr()?,
            "Starting gRPC server for RateLimitService with graceful shutdown"
        );

        Server::builder()
            .add_service(RateLimitServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .map_err(|e| {
                error!(error = %e, "gRPC server failed");
                RatelimitdError::Grpc(e)
            })
    }
}
