//! Error types for the ratelimitd service.

use thiserror::Error;

use crate::storage::StoreError;

/// Main error type for service-level operations.
#[derive(Error, Debug)]
pub enum RatelimitdError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage backend could not be opened
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// gRPC server errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::transport::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for service-level operations.
pub type Result<T> = std::result::Result<T, RatelimitdError>;
