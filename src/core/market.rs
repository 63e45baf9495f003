//! The API handed to request handlers and the CLI.
//!
//! `MarketData` owns every service of the cache (governor, exchange rate,
//! refreshers, evolution) and wires them to one store, one provider and one
//! clock. Reads never wait on a background loop: a cache miss costs at most
//! one bounded single-ticker fetch, and nothing at all while the governor is
//! paused.

use super::calendar::MarketCalendar;
use super::clock::Clock;
use super::config::AppConfig;
use super::dividends::{DividendRefreshOutcome, DividendRefresher};
use super::dollar::{DollarRate, DollarRateCache};
use super::error::MarketDataError;
use super::evolution::{EvolutionCalculator, EvolutionResponseCache, EvolutionResult};
use super::governor::RateLimitGovernor;
use super::position::{Position, PositionStore, Scope};
use super::price::QuoteProvider;
use super::refresher::{BatchRefresher, RefreshOutcome};
use super::ticker::normalize;
use super::valuation::{PortfolioValuation, PriceSource, summarize, value_position};
use crate::store::{DividendCache, DividendRecord, PriceCacheStore, SnapshotStore, Store};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument};

/// Point-in-time view of the cache health.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub paused_until: Option<DateTime<Utc>>,
    pub backoff_hours: u32,
    pub exchange_rate: DollarRate,
    pub last_price_refresh: Option<DateTime<Utc>>,
    pub cached_tickers: usize,
    pub market_open: bool,
    /// Start of the next trading window, or now while one is open.
    pub next_open: DateTime<Utc>,
}

pub struct MarketData {
    store: Arc<Store>,
    provider: Arc<dyn QuoteProvider>,
    positions: Arc<dyn PositionStore>,
    prices: Arc<PriceCacheStore>,
    dollar: DollarRateCache,
    governor: Arc<RateLimitGovernor>,
    refresher: BatchRefresher,
    dividends: Arc<DividendCache>,
    dividend_refresher: DividendRefresher,
    evolution: EvolutionCalculator,
    responses: EvolutionResponseCache,
    calendar: Arc<MarketCalendar>,
    clock: Arc<dyn Clock>,
    scheduled: AtomicBool,
}

impl MarketData {
    /// Builds every service from `config`, restoring the governor state and
    /// the exchange rate persisted in `store`.
    pub fn new(
        config: &AppConfig,
        store: Arc<Store>,
        provider: Arc<dyn QuoteProvider>,
        positions: Arc<dyn PositionStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let calendar = Arc::new(MarketCalendar::from_settings(&config.calendar)?);
        let governor = Arc::new(RateLimitGovernor::restore(
            clock.clone(),
            config.governor.max_backoff_hours,
            store.clone(),
        ));
        let prices = Arc::new(PriceCacheStore::new(store.price_cache_partition(), clock.clone()));
        let dollar = DollarRateCache::load(config.dollar.clone(), prices.clone(), clock.clone());
        let refresher = BatchRefresher::new(
            provider.clone(),
            prices.clone(),
            positions.clone(),
            governor.clone(),
            clock.clone(),
            config.refresh.clone(),
        )
        .exclude(dollar.pair());
        let dividends = Arc::new(DividendCache::new(store.dividends_partition()));
        let dividend_refresher = DividendRefresher::new(
            provider.clone(),
            positions.clone(),
            dividends.clone(),
            governor.clone(),
            calendar.clone(),
            clock.clone(),
            config.dividends.clone(),
        );
        let snapshots = Arc::new(SnapshotStore::new(store.snapshots_partition(), clock.clone()));
        let evolution = EvolutionCalculator::new(
            provider.clone(),
            snapshots,
            governor.clone(),
            config.evolution.clone(),
        );
        let responses = EvolutionResponseCache::new(
            clock.clone(),
            Duration::seconds(config.evolution.cache_ttl_secs),
        );

        Ok(Self {
            store,
            provider,
            positions,
            prices,
            dollar,
            governor,
            refresher,
            dividends,
            dividend_refresher,
            evolution,
            responses,
            calendar,
            clock,
            scheduled: AtomicBool::new(false),
        })
    }

    /// Marks the market as driven by a scheduler. False if one already is.
    pub(crate) fn claim_scheduler(&self) -> bool {
        !self.scheduled.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn release_scheduler(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }

    pub fn governor(&self) -> &RateLimitGovernor {
        &self.governor
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn price_cache(&self) -> &PriceCacheStore {
        &self.prices
    }

    /// Exchange rate in effect. Refetched only when the cached value is older
    /// than the freshness window and the governor allows it.
    pub async fn get_exchange_rate(&self) -> Decimal {
        self.dollar
            .refresh(self.provider.as_ref(), &self.governor, false)
            .await
    }

    /// Forces a new exchange-rate quote unless paused.
    pub async fn refresh_exchange_rate(&self) -> Decimal {
        self.dollar
            .refresh(self.provider.as_ref(), &self.governor, true)
            .await
    }

    /// Cached price for `ticker` (owner scope first, then global). On a miss
    /// one bounded fetch is attempted unless upstream access is paused.
    pub async fn get_current_price(
        &self,
        scope: &Scope,
        ticker: &str,
    ) -> Result<Option<Decimal>, MarketDataError> {
        let ticker = normalize(ticker);
        Ok(self.resolve_price(scope, &ticker).await?.map(|(price, _)| price))
    }

    async fn resolve_price(
        &self,
        scope: &Scope,
        ticker: &str,
    ) -> Result<Option<(Decimal, PriceSource)>, MarketDataError> {
        if let Some(price) = self.prices.get(scope, ticker)? {
            return Ok(Some((price, PriceSource::Cache)));
        }
        Ok(self.fetch_on_miss(scope, ticker).await)
    }

    async fn fetch_on_miss(&self, scope: &Scope, ticker: &str) -> Option<(Decimal, PriceSource)> {
        if self.governor.is_paused() {
            debug!(ticker, "Cache miss while rate limited");
            return None;
        }
        self.refresher
            .fetch_single(scope, ticker)
            .await
            .map(|price| (price, PriceSource::Live))
    }

    async fn owner_positions(&self, owner: &str) -> Result<Vec<Position>, MarketDataError> {
        let owners = self
            .positions
            .list_owner_ids()
            .await
            .map_err(|e| MarketDataError::Positions(e.to_string()))?;
        if !owners.iter().any(|o| o == owner) {
            return Err(MarketDataError::UnknownOwner(owner.to_string()));
        }
        self.positions
            .get_latest_positions(owner)
            .await
            .map_err(|e| MarketDataError::Positions(e.to_string()))
    }

    #[instrument(name = "PortfolioValuation", skip(self))]
    pub async fn get_portfolio_valuation(
        &self,
        owner: &str,
    ) -> Result<PortfolioValuation, MarketDataError> {
        let positions = self.owner_positions(owner).await?;
        let exchange_rate = self.get_exchange_rate().await;
        let scope = Scope::Owner(owner.to_string());
        let cached = self.prices.all_prices(&scope)?;

        let mut valued = Vec::with_capacity(positions.len());
        for position in &positions {
            let ticker = normalize(&position.ticker);
            let resolved = match cached.get(&ticker) {
                Some(price) => Some((*price, PriceSource::Cache)),
                None => self.fetch_on_miss(&scope, &ticker).await,
            };
            let (price, source) =
                resolved.unwrap_or((position.average_cost, PriceSource::AverageCost));
            valued.push(value_position(position, price, source, exchange_rate));
        }
        Ok(summarize(owner, valued, exchange_rate, self.clock.now()))
    }

    /// Value trajectory for `owner` over `[start, end]`, memoized for a short
    /// time per range.
    pub async fn get_evolution(
        &self,
        owner: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<EvolutionResult, MarketDataError> {
        let (start, end) = self.evolution.clamp_range(start, end)?;
        if let Some(hit) = self.responses.get(owner, start, end).await {
            debug!(owner, %start, %end, "Evolution served from response cache");
            return Ok(hit);
        }

        let positions = self.owner_positions(owner).await?;
        let result = self
            .evolution
            .compute(owner, &positions, start, end, self.dollar.rate())
            .await?;
        if !result.is_insufficient() {
            self.responses.put(owner, start, end, result.clone()).await;
        }
        Ok(result)
    }

    /// Interpolated curve between two known values; never touches upstream.
    pub fn synthetic_evolution(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        start_value: Decimal,
        end_value: Decimal,
    ) -> Result<EvolutionResult, MarketDataError> {
        self.evolution.synthetic(start, end, start_value, end_value)
    }

    /// Call whenever `owner`'s positions change.
    pub async fn invalidate_evolution_cache(&self, owner: &str) -> usize {
        let removed = self.responses.invalidate_owner(owner).await;
        if removed > 0 {
            info!(owner, removed, "Invalidated cached evolution ranges");
        }
        removed
    }

    pub async fn refresh_prices(&self) -> RefreshOutcome {
        self.refresher.refresh().await
    }

    /// Same as [`refresh_prices`](Self::refresh_prices) without the minimum
    /// interval between runs.
    pub async fn refresh_prices_now(&self) -> RefreshOutcome {
        self.refresher.refresh_now().await
    }

    pub async fn refresh_dividends(&self) -> DividendRefreshOutcome {
        self.dividend_refresher.refresh_all().await
    }

    /// Dividends cached for `owner`, oldest first. `since` defaults to the
    /// configured start of the dividend history.
    pub fn list_dividends(
        &self,
        owner: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<DividendRecord>, MarketDataError> {
        let since = since.unwrap_or_else(|| self.dividend_refresher.since());
        Ok(self.dividends.list(owner, since)?)
    }

    pub fn status(&self) -> Result<MarketStatus, MarketDataError> {
        let state = self.governor.state();
        let now = self.clock.now();
        Ok(MarketStatus {
            paused_until: state.paused_until,
            backoff_hours: state.backoff_hours,
            exchange_rate: self.dollar.current(),
            last_price_refresh: self.refresher.last_started(),
            cached_tickers: self.prices.list_distinct_tickers()?.len(),
            market_open: self.calendar.is_market_open(now),
            next_open: self.calendar.next_open(now),
        })
    }

    /// Flushes pending writes. Called on shutdown.
    pub fn persist(&self) -> Result<(), MarketDataError> {
        Ok(self.store.persist()?)
    }
}
