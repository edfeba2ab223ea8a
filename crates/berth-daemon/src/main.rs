//! Berth Daemon - single-node container fleet reconciler
//!
//! Keeps declared services running, watches their health, and keeps the
//! reverse proxy's route table in step with what is healthy.

use berth_daemon::{shutdown_signal, BerthConfig, Daemon, DaemonResult};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Berth Daemon CLI
#[derive(Parser)]
#[command(name = "berthd")]
#[command(about = "Berth Daemon - container fleet reconciler", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "BERTH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overrides logging.level
    #[arg(long, env = "BERTH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "BERTH_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> DaemonResult<()> {
    let cli = Cli::parse();

    let mut config = BerthConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json {
        config.logging.json = true;
    }

    // RUST_LOG wins over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        engine = ?config.runtime.kind,
        storage = ?config.storage.path,
        proxy = ?config.proxy.endpoint,
        "Starting berthd"
    );

    let daemon = Daemon::build(&config).await?;
    daemon.run(shutdown_signal()).await
}
