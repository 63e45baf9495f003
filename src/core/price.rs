//! Quote provider abstraction and the series it returns.

use super::error::ProviderError;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Daily history for one ticker, optionally with a live current price.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceSeries {
    pub current: Option<Decimal>,
    /// Daily closes in ascending date order. Gaps are `None`.
    pub closes: Vec<(NaiveDate, Option<Decimal>)>,
}

impl PriceSeries {
    pub fn latest_close(&self) -> Option<Decimal> {
        self.closes.iter().rev().find_map(|(_, close)| *close)
    }

    /// Live price if offered, else the most recent non-missing close.
    pub fn resolve_price(&self) -> Option<Decimal> {
        self.current.or_else(|| self.latest_close())
    }

    /// Non-missing closes only.
    pub fn observations(&self) -> impl Iterator<Item = (NaiveDate, Decimal)> + '_ {
        self.closes
            .iter()
            .filter_map(|(date, close)| close.map(|c| (*date, c)))
    }
}

pub type DividendHistory = HashMap<String, Vec<(NaiveDate, Decimal)>>;

/// Upstream market data source. Implementations must bound every call with
/// a timeout.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    async fn fetch_current(&self, ticker: &str) -> Result<Decimal, ProviderError>;

    /// One request for the whole working set. Tickers the provider does not
    /// know are omitted from the map; a systemic failure fails the call.
    async fn fetch_batch_history(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<String, PriceSeries>, ProviderError>;

    /// Per-share dividend payments dated within `[start, end]`.
    async fn fetch_dividends(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DividendHistory, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_resolve_price_prefers_current() {
        let series = PriceSeries {
            current: Some(dec!(10.5)),
            closes: vec![(day(1), Some(dec!(9)))],
        };
        assert_eq!(series.resolve_price(), Some(dec!(10.5)));
    }

    #[test]
    fn test_resolve_price_skips_trailing_gaps() {
        let series = PriceSeries {
            current: None,
            closes: vec![(day(1), Some(dec!(9))), (day(2), Some(dec!(9.2))), (day(3), None)],
        };
        assert_eq!(series.resolve_price(), Some(dec!(9.2)));
        assert_eq!(series.observations().count(), 2);
    }

    #[test]
    fn test_empty_series_has_no_price() {
        assert_eq!(PriceSeries::default().resolve_price(), None);
    }
}
