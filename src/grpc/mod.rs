//! gRPC front end for the rate limit service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::RateLimitServiceImpl;

// Include the generated protobuf code
pub mod proto {
    tonic::include_proto!("ratelimitd.v1");
}

// Re-export commonly used types
pub use proto::{
    rate_limit_service_client::RateLimitServiceClient,
    rate_limit_service_server::RateLimitServiceServer, ConsumeRequest, PeekRequest, ResetRequest,
    ResetResponse, UsageResponse,
};
