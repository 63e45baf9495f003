//! Batch refresh of every known ticker against the quote provider.

use super::clock::Clock;
use super::error::ProviderError;
use super::governor::RateLimitGovernor;
use super::position::{PositionStore, Scope};
use super::price::QuoteProvider;
use super::ticker::normalize;
use crate::store::PriceCacheStore;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// History window requested from the provider, in days.
    pub window_days: i64,
    /// Triggers closer together than this are skipped.
    pub min_interval_secs: i64,
    /// Cheap symbol fetched before a batch to check connectivity.
    pub probe_symbol: String,
    /// Upper bound on a single-ticker fetch from the read path.
    pub single_fetch_timeout_secs: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            window_days: 30,
            min_interval_secs: 25 * 60,
            probe_symbol: "AAPL".to_string(),
            single_fetch_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    Paused,
    Recent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefreshStatus {
    Skipped(SkipReason),
    /// The connectivity probe failed; nothing was requested.
    Aborted,
    /// The batch failed as a whole. Nothing was evicted.
    Systemic,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub total_requested: usize,
    pub updated: usize,
    pub delisted_tickers: Vec<String>,
    pub evicted: usize,
}

impl RefreshOutcome {
    fn with_status(status: RefreshStatus, total_requested: usize) -> Self {
        Self {
            status,
            total_requested,
            updated: 0,
            delisted_tickers: Vec::new(),
            evicted: 0,
        }
    }
}

pub struct BatchRefresher {
    provider: Arc<dyn QuoteProvider>,
    prices: Arc<PriceCacheStore>,
    positions: Arc<dyn PositionStore>,
    governor: Arc<RateLimitGovernor>,
    clock: Arc<dyn Clock>,
    settings: RefreshSettings,
    /// Symbols never part of the working set (the exchange-rate pair).
    excluded: BTreeSet<String>,
    last_started: Mutex<Option<DateTime<Utc>>>,
}

impl BatchRefresher {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        prices: Arc<PriceCacheStore>,
        positions: Arc<dyn PositionStore>,
        governor: Arc<RateLimitGovernor>,
        clock: Arc<dyn Clock>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            provider,
            prices,
            positions,
            governor,
            clock,
            settings,
            excluded: BTreeSet::new(),
            last_started: Mutex::new(None),
        }
    }

    pub fn exclude(mut self, ticker: &str) -> Self {
        self.excluded.insert(ticker.to_string());
        self
    }

    pub fn last_started(&self) -> Option<DateTime<Utc>> {
        *self.last_started.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Claims the refresh slot unless one was claimed within the minimum
    /// interval. The slot is taken before any work so overlapping triggers
    /// from different loops collapse into one run.
    fn claim_slot(&self) -> bool {
        let now = self.clock.now();
        let mut last = self.last_started.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            if now - prev < Duration::seconds(self.settings.min_interval_secs) {
                debug!(
                    minutes_since = (now - prev).num_minutes(),
                    "Prices refreshed recently, skipping"
                );
                return false;
            }
        }
        *last = Some(now);
        true
    }

    /// Refresh honouring the minimum interval between runs.
    pub async fn refresh(&self) -> RefreshOutcome {
        if self.governor.is_paused() {
            info!("Rate limited, skipping price refresh");
            return RefreshOutcome::with_status(RefreshStatus::Skipped(SkipReason::Paused), 0);
        }
        if !self.claim_slot() {
            return RefreshOutcome::with_status(RefreshStatus::Skipped(SkipReason::Recent), 0);
        }
        self.run().await
    }

    /// Refresh ignoring the minimum interval. Still respects the governor.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        if self.governor.is_paused() {
            info!("Rate limited, skipping price refresh");
            return RefreshOutcome::with_status(RefreshStatus::Skipped(SkipReason::Paused), 0);
        }
        *self.last_started.lock().unwrap_or_else(|p| p.into_inner()) = Some(self.clock.now());
        self.run().await
    }

    /// Normalized tickers from every owner's positions plus whatever is
    /// already cached.
    async fn working_set(&self) -> Vec<String> {
        let mut tickers = BTreeSet::new();
        match self.positions.list_owner_ids().await {
            Ok(owners) => {
                for owner in owners {
                    match self.positions.get_latest_positions(&owner).await {
                        Ok(positions) => {
                            tickers.extend(positions.iter().map(|p| normalize(&p.ticker)));
                        }
                        Err(e) => warn!(owner, error = %e, "Could not read positions"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not list owners"),
        }
        match self.prices.list_distinct_tickers() {
            Ok(cached) => tickers.extend(cached.iter().map(|t| normalize(t))),
            Err(e) => warn!(error = %e, "Could not list cached tickers"),
        }
        tickers.retain(|t| !self.excluded.contains(t));
        tickers.into_iter().collect()
    }

    #[instrument(name = "BatchRefresh", skip(self))]
    async fn run(&self) -> RefreshOutcome {
        let tickers = self.working_set().await;
        if tickers.is_empty() {
            info!("No tickers to refresh");
            return RefreshOutcome::with_status(RefreshStatus::Completed, 0);
        }
        let total = tickers.len();

        if let Err(e) = self.provider.fetch_current(&self.settings.probe_symbol).await {
            warn!(error = %e, probe = %self.settings.probe_symbol, "Connectivity probe failed");
            self.governor.record_failure();
            return RefreshOutcome::with_status(RefreshStatus::Aborted, total);
        }

        let end = self.clock.now().date_naive();
        let start = end - Duration::days(self.settings.window_days);
        info!(total, %start, %end, "Requesting batch history");

        let series = match self.provider.fetch_batch_history(&tickers, start, end).await {
            Ok(series) => series,
            Err(e) => {
                warn!(error = %e, "Batch history request failed");
                self.governor.record_failure();
                return RefreshOutcome::with_status(RefreshStatus::Systemic, total);
            }
        };

        let mut updates = Vec::new();
        let mut failed = Vec::new();
        for ticker in &tickers {
            match series.get(ticker).and_then(|s| s.resolve_price()) {
                Some(price) => updates.push((ticker.clone(), price)),
                None => {
                    debug!(ticker, "No price in batch response");
                    failed.push(ticker.clone());
                }
            }
        }

        if failed.len() == total {
            warn!(total, "Every ticker failed, treating as rate limit and keeping cache");
            self.governor.record_failure();
            return RefreshOutcome {
                delisted_tickers: failed,
                ..RefreshOutcome::with_status(RefreshStatus::Systemic, total)
            };
        }

        let updated = match self.prices.upsert_many(&updates).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to write refreshed prices");
                0
            }
        };
        let evicted = match self.prices.delete_many(&failed).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Failed to evict delisted tickers");
                0
            }
        };
        if !failed.is_empty() {
            info!(count = failed.len(), tickers = ?failed, "Evicted possibly delisted tickers");
        }
        self.governor.record_success();
        info!(updated, total, "Price refresh completed");

        RefreshOutcome {
            status: RefreshStatus::Completed,
            total_requested: total,
            updated,
            delisted_tickers: failed,
            evicted,
        }
    }

    /// One bounded `fetch_current` for the read path. Never a batch.
    #[instrument(name = "SingleFetch", skip(self, scope), fields(scope = %scope))]
    pub async fn fetch_single(&self, scope: &Scope, ticker: &str) -> Option<Decimal> {
        if self.governor.is_paused() {
            return None;
        }
        let limit = std::time::Duration::from_secs(self.settings.single_fetch_timeout_secs);
        let result = tokio::time::timeout(limit, self.provider.fetch_current(ticker))
            .await
            .unwrap_or(Err(ProviderError::Timeout));
        match result {
            Ok(price) => {
                if let Err(e) = self.prices.upsert(scope, ticker, price).await {
                    warn!(error = %e, "Failed to cache fetched price");
                }
                Some(price)
            }
            Err(ProviderError::NotFound(_)) => {
                debug!("Ticker unknown to provider");
                None
            }
            Err(e) => {
                warn!(error = %e, "Single ticker fetch failed");
                self.governor.record_failure();
                None
            }
        }
    }
}
