//! Configuration management for ratelimitd.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RatelimitdError, Result};

/// Prefix for environment overrides, e.g. `RATELIMITD__SERVER__GRPC_ADDR`.
const ENV_PREFIX: &str = "RATELIMITD";

/// Main configuration for the ratelimitd service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatelimitdConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter worker configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Bucket storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

/// Limiter worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Capacity of the worker's inbound request queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_queue_capacity() -> usize {
    crate::ratelimit::DEFAULT_QUEUE_CAPACITY
}

/// Storage backend selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local map, nothing is shared between instances
    #[default]
    Memory,
    /// Shared Redis server
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
    /// Shared memcached server
    Memcache {
        #[serde(default = "default_memcache_url")]
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl StorageConfig {
    /// Default settings for the named backend.
    pub fn for_backend(name: &str) -> Result<Self> {
        match name {
            "memory" => Ok(StorageConfig::Memory),
            "redis" => Ok(StorageConfig::Redis {
                url: default_redis_url(),
                key_prefix: default_key_prefix(),
            }),
            "memcache" => Ok(StorageConfig::Memcache {
                url: default_memcache_url(),
                key_prefix: default_key_prefix(),
            }),
            other => Err(RatelimitdError::Config(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_memcache_url() -> String {
    "memcache://127.0.0.1:11211".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit:".to_string()
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl RatelimitdConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RatelimitdError::Config(e.to_string()))
    }

    /// Layer defaults, an optional config file and `RATELIMITD__*`
    /// environment variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RatelimitdError::Config(e.to_string()))
    }
}
