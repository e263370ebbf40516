use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use crate::monitor::{GlobalMonitor, MonitorError};

pub struct MonitorOptions {
    pub file_glob: String,
    pub short_name_regex: String,
    pub file_check_period: f64,
    pub squash_period: f64,
    pub close_timeout: f64,
    pub show_statistics_after: u64,
}

/// Tail the glob until interrupted.
pub async fn run(options: MonitorOptions) -> Result<(), MonitorError> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => {
                error!(error = %err, "failed to listen for shutdown signal");
            }
        }
    });

    let mut monitor = GlobalMonitor::new(
        &options.file_glob,
        &options.short_name_regex,
        Duration::from_secs_f64(options.close_timeout),
    )?;
    let reader_handle = monitor.reader.start(shutdown_rx.clone());

    monitor
        .run(
            Duration::from_secs_f64(options.file_check_period),
            Duration::from_secs_f64(options.squash_period),
            options.show_statistics_after,
            shutdown_rx,
        )
        .await?;

    let _ = reader_handle.await;
    Ok(())
}
