//! Replication daemon: subscribes to a MariaDB primary and feeds a
//! columnar analytic store.
//!
//! Usage:
//!   # Replicate two candidate primaries into a sink
//!   colstreamd --primary db1:3306,db2:3306 --sink cs:3306
//!
//!   # Restrict to selected tables and start from a known GTID
//!   colstreamd --primary db1:3306 --sink cs:3306 \
//!     --tables shop.orders,shop.items 0-1-4200
//!
//!   # Keep row history instead of applying updates and deletes
//!   colstreamd --primary db1:3306 --sink cs:3306 --mode transform
//!
//! SIGINT, SIGTERM and SIGHUP request a clean shutdown. The process exits
//! 0 on clean shutdown and 1 when the reader stopped making progress.

mod cli;

use clap::Parser;
use cli::Cli;
use colstream::Replicator;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            std::process::exit(1);
        }
    };

    info!(
        primaries = config.primary_servers.len(),
        sink = %config.sink_server,
        mode = ?config.mode,
        "starting replication"
    );

    let mut replicator = Replicator::start(config)?;

    let clean = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received");
            true
        }
        _ = wait_until_failed(&replicator) => {
            error!(error = %replicator.error(), "replication stopped making progress");
            false
        }
    };

    replicator.stop().await;
    info!("shut down");

    if !clean {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolves once the replicator reports it is no longer making progress.
async fn wait_until_failed(replicator: &Replicator) {
    while replicator.ok() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Wait for SIGINT, SIGTERM or SIGHUP.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let hangup = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .expect("failed to install SIGHUP handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let hangup = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = hangup => {}
    }
}
