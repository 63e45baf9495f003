use crate::core::{MarketData, Scheduler, SchedulerSettings};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Runs the background loops until Ctrl-C.
pub async fn run(market: Arc<MarketData>, settings: SchedulerSettings) -> Result<()> {
    let scheduler = Scheduler::new(market.clone(), settings);
    let handle = scheduler
        .start()
        .context("Scheduler was already running")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    handle.shutdown().await;
    market.persist()?;
    Ok(())
}
