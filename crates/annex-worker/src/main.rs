//! Annex Worker - Main entry point

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use annex_common::logging::{init_logging, LogConfig};
use annex_worker::{
    config::WorkerConfig,
    consumer::JobConsumer,
    fetcher::Fetcher,
    transform::NoopTransform,
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::from_env()?.with_filter("annex_worker=debug");
    init_logging(&log_config)?;

    info!("Starting Annex Worker");

    let config = WorkerConfig::from_env()?;
    info!(
        "Configuration loaded - work root {}, fan-out {}",
        config.work_root.display(),
        config.fan_out_limit
    );

    tokio::fs::create_dir_all(&config.work_root).await?;

    let fetcher = Fetcher::new(&config.s3);
    let consumer = JobConsumer::connect(config, fetcher, Arc::new(NoopTransform)).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    consumer.run(shutdown).await?;

    info!("Worker shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => tracing::error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
