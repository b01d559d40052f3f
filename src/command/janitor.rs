//! The `janitor` subcommand: run all maintenance job loops until SIGINT.

use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::Error;
use crate::janitor::Janitor;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub async fn run(janitor: Janitor) -> Result<(), Error> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let loops = tokio::spawn(async move { janitor.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    info!("received SIGINT, stopping job loops (grace period {SHUTDOWN_GRACE:?})");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, loops).await;
    info!("shutdown complete");
    Ok(())
}
