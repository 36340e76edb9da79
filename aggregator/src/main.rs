//! Aggregator Service
//!
//! Opens the configured metric store, runs its background work (file backups
//! or the SQL schema check), and serves health and Prometheus endpoints until
//! interrupted. On shutdown the store performs its final flush before exit.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tally_aggregator::{server::http, storage, AggregatorConfig};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "tally-aggregator", about = "Metric aggregation and storage service")]
struct Args {
    /// Config file (TOML, JSON or YAML)
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "TALLY_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = AggregatorConfig::load(args.config.as_deref()).context("Invalid configuration")?;
    let admin_addr: SocketAddr = config
        .admin_addr
        .parse()
        .context("Invalid admin listen address")?;

    let store = storage::open(&config)
        .await
        .context("Failed to open metric storage")?;
    info!("Starting Tally aggregator ({} storage)", store.backend());

    let cancel = CancellationToken::new();

    let store_task = {
        let store = store.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { store.start(cancel).await })
    };

    let mut admin_task =
        tokio::spawn(http::serve_admin(admin_addr, store.clone(), cancel.clone()));

    // Stop on a signal, or as soon as the admin server exits on its own.
    let admin_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down...");
            cancel.cancel();
            admin_task.await
        }
        result = &mut admin_task => {
            cancel.cancel();
            result
        }
    };

    match admin_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Admin server error: {}", e),
        Err(e) => error!("Admin server task failed: {}", e),
    }

    store_task
        .await
        .context("Storage task panicked")?
        .context("Storage stopped with an error")?;

    info!("Aggregator stopped");
    Ok(())
}
