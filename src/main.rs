//! S3Adapter -- S3-compatible gateway server.
//!
//! SIGTERM/SIGINT stop accepting connections; in-flight requests get
//! `server.shutdown_timeout` seconds to finish.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use s3adapter::config::{load_config, Config};
use s3adapter::credentials::SqliteCredentialStore;
use s3adapter::gateway::BackendRegistry;

/// Command-line arguments for the S3Adapter server.
#[derive(Parser, Debug)]
#[command(
    name = "s3adapter",
    version,
    about = "S3-compatible gateway over pluggable object-storage backends"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3adapter.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_tracing(&config);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        s3adapter::metrics::init_metrics();
        s3adapter::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let credentials_path = &config.credentials.path;
    if let Some(parent) = std::path::Path::new(credentials_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = SqliteCredentialStore::new(credentials_path)?;
    info!("SQLite credential store opened at {}", credentials_path);

    let registry = BackendRegistry::with_defaults(&config.gateway);
    info!("Backend engines: {}", registry.engines().join(", "));

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(s3adapter::AppState {
        config,
        registry: Arc::new(registry),
        credentials: Arc::new(store),
    });
    let app = s3adapter::server::app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("S3Adapter listening on {}", bind_addr);

    let stopping = Arc::new(tokio::sync::Notify::new());
    let signal = {
        let stopping = stopping.clone();
        async move {
            shutdown_signal().await;
            stopping.notify_waiters();
        }
    };
    let serve = axum::serve(listener, app).with_graceful_shutdown(signal);

    tokio::select! {
        res = serve => res?,
        _ = async {
            stopping.notified().await;
            tokio::time::sleep(grace).await;
        } => warn!("Shutdown timeout of {:?} elapsed, dropping in-flight requests", grace),
    }

    info!("S3Adapter shut down");
    Ok(())
}

/// `RUST_LOG` wins over `logging.level`; `logging.format` picks text or json.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
