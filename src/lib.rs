pub mod cli;
pub mod core;
pub mod providers;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

use crate::core::config::AppConfig;
use crate::core::{MarketData, SystemClock};
use crate::providers::yahoo_finance::YahooQuoteProvider;
use crate::store::{ConfigPositionStore, Store};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub use crate::cli::refresh::RefreshTargets;

#[derive(Debug, Clone)]
pub enum AppCommand {
    Serve,
    Refresh(RefreshTargets),
    Valuation {
        owner: Option<String>,
    },
    Evolution {
        owner: String,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        synthetic: Option<(Decimal, Decimal)>,
    },
    Status,
}

/// Wires the store, the Yahoo provider and the configured owners into a
/// [`MarketData`].
pub fn build_market(config: &AppConfig) -> Result<MarketData> {
    let data_path = config.default_data_path()?;
    std::fs::create_dir_all(&data_path)
        .with_context(|| format!("Failed to create data directory: {}", data_path.display()))?;
    let store = Store::open(&data_path)
        .with_context(|| format!("Failed to open store at {}", data_path.display()))?;

    let provider = YahooQuoteProvider::new(
        config.yahoo_base_url(),
        Duration::from_secs(config.yahoo_timeout_secs()),
    )
    .context("Failed to build Yahoo client")?;
    let positions = ConfigPositionStore::new(
        config
            .owners
            .iter()
            .map(|owner| (owner.id.clone(), owner.positions.clone())),
    );

    MarketData::new(
        config,
        Arc::new(store),
        Arc::new(provider),
        Arc::new(positions),
        Arc::new(SystemClock),
    )
}

pub async fn run_command(command: AppCommand, config_path: Option<&str>) -> Result<()> {
    info!("marketcache starting...");

    let config = match config_path {
        Some(path) => AppConfig::load_from_path(path)?,
        None => AppConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let market = build_market(&config)?;
    match command {
        AppCommand::Serve => cli::serve::run(Arc::new(market), config.scheduler.clone()).await,
        AppCommand::Refresh(targets) => cli::refresh::run(&market, targets).await,
        AppCommand::Valuation { owner } => {
            let owners = match owner {
                Some(owner) => vec![owner],
                None => config.owners.iter().map(|o| o.id.clone()).collect(),
            };
            cli::valuation::run(&market, &owners).await
        }
        AppCommand::Evolution {
            owner,
            start,
            end,
            synthetic,
        } => cli::evolution::run(&market, &owner, start, end, synthetic).await,
        AppCommand::Status => cli::status::run(&market).await,
    }
}
