//! Daily refresh of dividends received per owner.

use super::calendar::MarketCalendar;
use super::clock::Clock;
use super::governor::RateLimitGovernor;
use super::position::PositionStore;
use super::price::QuoteProvider;
use super::ticker::normalize;
use crate::store::{DividendCache, DividendRecord};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DividendSettings {
    /// Payments before this date are never fetched.
    pub since: NaiveDate,
}

impl Default for DividendSettings {
    fn default() -> Self {
        Self {
            since: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or(NaiveDate::MIN),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DividendRefreshOutcome {
    pub paused: bool,
    pub owners_refreshed: usize,
    pub owners_skipped: usize,
    pub inserted: usize,
    pub failed_owners: Vec<String>,
}

/// Value received for a payment: per-share amount times whole shares held,
/// rounded to cents.
pub fn dividend_value(amount_per_share: Decimal, quantity: i64) -> Decimal {
    (amount_per_share * Decimal::from(quantity))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

pub struct DividendRefresher {
    provider: Arc<dyn QuoteProvider>,
    positions: Arc<dyn PositionStore>,
    cache: Arc<DividendCache>,
    governor: Arc<RateLimitGovernor>,
    calendar: Arc<MarketCalendar>,
    clock: Arc<dyn Clock>,
    settings: DividendSettings,
}

impl DividendRefresher {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        positions: Arc<dyn PositionStore>,
        cache: Arc<DividendCache>,
        governor: Arc<RateLimitGovernor>,
        calendar: Arc<MarketCalendar>,
        clock: Arc<dyn Clock>,
        settings: DividendSettings,
    ) -> Self {
        Self {
            provider,
            positions,
            cache,
            governor,
            calendar,
            clock,
            settings,
        }
    }

    pub fn since(&self) -> NaiveDate {
        self.settings.since
    }

    pub async fn refresh_all(&self) -> DividendRefreshOutcome {
        let mut outcome = DividendRefreshOutcome::default();
        if self.governor.is_paused() {
            info!("Rate limited, skipping dividend refresh");
            outcome.paused = true;
            return outcome;
        }

        let owners = match self.positions.list_owner_ids().await {
            Ok(owners) => owners,
            Err(e) => {
                warn!(error = %e, "Could not list owners for dividend refresh");
                return outcome;
            }
        };

        for owner in owners {
            if self.governor.is_paused() {
                outcome.paused = true;
                break;
            }
            match self.refresh_owner(&owner).await {
                Ok(Some(inserted)) => {
                    outcome.owners_refreshed += 1;
                    outcome.inserted += inserted;
                }
                Ok(None) => outcome.owners_skipped += 1,
                Err(e) => {
                    warn!(owner, error = %e, "Dividend refresh failed");
                    outcome.failed_owners.push(owner);
                }
            }
        }
        info!(
            refreshed = outcome.owners_refreshed,
            skipped = outcome.owners_skipped,
            inserted = outcome.inserted,
            "Dividend refresh finished"
        );
        outcome
    }

    /// Returns `None` when the owner was already refreshed today or holds
    /// nothing, else the number of new payments stored.
    pub async fn refresh_owner(&self, owner: &str) -> anyhow::Result<Option<usize>> {
        let now = self.clock.now();
        let today = self.calendar.local_date(now);
        if let Some(last) = self.cache.last_updated(owner)? {
            if self.calendar.local_date(last) >= today {
                debug!(owner, "Dividends already refreshed today");
                return Ok(None);
            }
        }

        let positions = self.positions.get_latest_positions(owner).await?;
        // normalized ticker -> (display ticker, whole shares)
        let mut holdings: BTreeMap<String, (String, i64)> = BTreeMap::new();
        for position in &positions {
            let display = position.ticker.trim().to_uppercase();
            let shares = position.quantity.trunc().to_i64().unwrap_or(0);
            holdings.insert(normalize(&position.ticker), (display, shares));
        }
        if holdings.is_empty() {
            return Ok(None);
        }

        let tickers: Vec<String> = holdings.keys().cloned().collect();
        let today = self.calendar.local_date(self.clock.now());
        let history = match self
            .provider
            .fetch_dividends(&tickers, self.settings.since, today)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                if e.is_systemic() {
                    self.governor.record_failure();
                }
                return Err(e.into());
            }
        };
        self.governor.record_success();

        let mut inserted = 0;
        for (ticker, payments) in history {
            let Some((display, shares)) = holdings.get(&ticker) else {
                continue;
            };
            for (date, amount) in payments {
                if amount <= Decimal::ZERO || *shares <= 0 || date < self.settings.since {
                    continue;
                }
                let record = DividendRecord {
                    owner: owner.to_string(),
                    ticker: display.clone(),
                    date,
                    amount_per_share: amount,
                    quantity: *shares,
                    value: dividend_value(amount, *shares),
                    updated_at: now,
                };
                if self.cache.insert_if_absent(&record)? {
                    inserted += 1;
                }
            }
        }
        if inserted > 0 {
            info!(owner, inserted, "Stored new dividends");
        }
        Ok(Some(inserted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::error::ProviderError;
    use crate::core::position::Position;
    use crate::store::{ConfigPositionStore, Store};
    use crate::test_support::MockQuoteProvider;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn positions() -> Arc<ConfigPositionStore> {
        Arc::new(ConfigPositionStore::new([(
            "alice".to_string(),
            vec![Position {
                ticker: "itsa4".to_string(),
                average_cost: dec!(9),
                quantity: dec!(100.7),
            }],
        )]))
    }

    #[test]
    fn test_dividend_value_rounds_to_cents() {
        assert_eq!(dividend_value(dec!(0.12346), 100), dec!(12.35));
        assert_eq!(dividend_value(dec!(0.12345), 100), dec!(12.34));
        assert_eq!(dividend_value(dec!(1.5), 3), dec!(4.50));
    }

    #[tokio::test]
    async fn test_refresh_inserts_once_per_day() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 8, 14, 0, 0).unwrap(),
        ));
        let cache = Arc::new(DividendCache::new(store.dividends_partition()));
        let governor = Arc::new(RateLimitGovernor::new(clock.clone(), 24));
        let provider = Arc::new(MockQuoteProvider::new().with_dividends(
            "ITSA4.SA",
            vec![
                (NaiveDate::from_ymd_opt(2022, 6, 1).unwrap(), dec!(1)),
                (NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(), dec!(0.25)),
            ],
        ));
        let refresher = DividendRefresher::new(
            provider.clone(),
            positions(),
            cache.clone(),
            governor,
            Arc::new(MarketCalendar::default()),
            clock.clone(),
            DividendSettings::default(),
        );

        let outcome = refresher.refresh_all().await;
        assert_eq!(outcome.inserted, 1);
        let rows = cache.list("alice", refresher.since()).unwrap();
        assert_eq!(rows[0].ticker, "ITSA4");
        assert_eq!(rows[0].quantity, 100);
        assert_eq!(rows[0].value, dec!(25));

        // Same local day: skipped without calling upstream.
        clock.advance(Duration::hours(2));
        let outcome = refresher.refresh_all().await;
        assert_eq!(outcome.owners_skipped, 1);
        assert_eq!(provider.dividend_calls(), 1);

        // Next day: fetched again, nothing new to insert.
        clock.advance(Duration::days(1));
        let outcome = refresher.refresh_all().await;
        assert_eq!(outcome.owners_refreshed, 1);
        assert_eq!(outcome.inserted, 0);
    }

    #[tokio::test]
    async fn test_systemic_error_pauses_and_paused_skips() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 8, 14, 0, 0).unwrap(),
        ));
        let governor = Arc::new(RateLimitGovernor::new(clock.clone(), 24));
        let provider =
            Arc::new(MockQuoteProvider::new().with_dividends_error(ProviderError::RateLimited));
        let refresher = DividendRefresher::new(
            provider.clone(),
            positions(),
            Arc::new(DividendCache::new(store.dividends_partition())),
            governor.clone(),
            Arc::new(MarketCalendar::default()),
            clock,
            DividendSettings::default(),
        );

        let outcome = refresher.refresh_all().await;
        assert_eq!(outcome.failed_owners, vec!["alice".to_string()]);
        assert!(governor.is_paused());

        let outcome = refresher.refresh_all().await;
        assert!(outcome.paused);
        assert_eq!(provider.dividend_calls(), 1);
    }
}
