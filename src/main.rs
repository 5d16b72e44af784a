use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratelimitd::config::{LogFormat, RatelimitdConfig, StorageConfig};
use ratelimitd::grpc::GrpcServer;
use ratelimitd::ratelimit::RateLimiter;
use ratelimitd::storage;

/// Sliding-window rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "ratelimitd", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the gRPC server to listen on
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,

    /// Storage backend: memory, redis or memcache
    #[arg(long)]
    backend: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_tracing(&config);

    info!("Starting ratelimitd");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        grpc_addr = %config.server.grpc_addr,
        storage = ?config.storage,
        "Configuration loaded"
    );

    let store = storage::connect(&config.storage).await?;

    let rate_limiter = Arc::new(RateLimiter::with_capacity(
        store,
        config.limiter.queue_capacity,
    ));
    rate_limiter.start()?;

    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&rate_limiter));

    // Run the server with graceful shutdown on Ctrl+C
    let served = grpc_server.serve_with_shutdown(shutdown_signal()).await;

    // Answer whatever is still queued before exiting.
    rate_limiter.stop().await;
    served?;

    info!("ratelimitd stopped");
    Ok(())
}

/// Config file and environment first, then command line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<RatelimitdConfig> {
    let mut config = RatelimitdConfig::load(cli.config.as_deref())?;

    if let Some(addr) = cli.grpc_addr {
        config.server.grpc_addr = addr;
    }
    if let Some(backend) = cli.backend.as_deref() {
        config.storage = StorageConfig::for_backend(backend)?;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    Ok(config)
}

fn init_tracing(config: &RatelimitdConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
