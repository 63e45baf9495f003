//! Test doubles shared by the unit tests.

use crate::core::clock::Clock;
use crate::core::error::ProviderError;
use crate::core::price::{DividendHistory, PriceSeries, QuoteProvider};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Builds a series of daily closes with no live price.
pub fn series(closes: &[(NaiveDate, Decimal)]) -> PriceSeries {
    PriceSeries {
        current: None,
        closes: closes.iter().map(|(d, c)| (*d, Some(*c))).collect(),
    }
}

/// Clock that follows tokio's (pausable) time from a fixed wall-clock start.
pub struct TokioClock {
    start: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::from_std(self.origin.elapsed()).unwrap()
    }
}

/// Scripted quote provider that counts calls.
#[derive(Default)]
pub struct MockQuoteProvider {
    current: Mutex<HashMap<String, Decimal>>,
    current_error: Mutex<Option<ProviderError>>,
    history: Mutex<HashMap<String, PriceSeries>>,
    history_error: Mutex<Option<ProviderError>>,
    dividends: Mutex<DividendHistory>,
    dividends_error: Mutex<Option<ProviderError>>,
    current_calls: AtomicUsize,
    history_calls: AtomicUsize,
    dividend_calls: AtomicUsize,
}

impl MockQuoteProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_current(self, ticker: &str, price: Decimal) -> Self {
        self.current.lock().unwrap().insert(ticker.to_string(), price);
        self
    }

    pub fn with_current_error(self, error: ProviderError) -> Self {
        self.set_current_error(Some(error));
        self
    }

    pub fn with_history(self, ticker: &str, series: PriceSeries) -> Self {
        self.history.lock().unwrap().insert(ticker.to_string(), series);
        self
    }

    pub fn with_history_error(self, error: ProviderError) -> Self {
        self.set_history_error(Some(error));
        self
    }

    pub fn with_dividends(self, ticker: &str, payments: Vec<(NaiveDate, Decimal)>) -> Self {
        self.dividends.lock().unwrap().insert(ticker.to_string(), payments);
        self
    }

    pub fn with_dividends_error(self, error: ProviderError) -> Self {
        *self.dividends_error.lock().unwrap() = Some(error);
        self
    }

    pub fn set_current_error(&self, error: Option<ProviderError>) {
        *self.current_error.lock().unwrap() = error;
    }

    pub fn set_history_error(&self, error: Option<ProviderError>) {
        *self.history_error.lock().unwrap() = error;
    }

    pub fn current_calls(&self) -> usize {
        self.current_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn dividend_calls(&self) -> usize {
        self.dividend_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.current_calls() + self.history_calls() + self.dividend_calls()
    }
}

#[async_trait]
impl QuoteProvider for MockQuoteProvider {
    async fn fetch_current(&self, ticker: &str) -> Result<Decimal, ProviderError> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.current_error.lock().unwrap().clone() {
            return Err(e);
        }
        self.current
            .lock()
            .unwrap()
            .get(ticker)
            .copied()
            .ok_or_else(|| ProviderError::NotFound(ticker.to_string()))
    }

    async fn fetch_batch_history(
        &self,
        tickers: &[String],
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<HashMap<String, PriceSeries>, ProviderError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.history_error.lock().unwrap().clone() {
            return Err(e);
        }
        let history = self.history.lock().unwrap();
        Ok(tickers
            .iter()
            .filter_map(|t| history.get(t).map(|s| (t.clone(), s.clone())))
            .collect())
    }

    async fn fetch_dividends(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DividendHistory, ProviderError> {
        self.dividend_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.dividends_error.lock().unwrap().clone() {
            return Err(e);
        }
        let dividends = self.dividends.lock().unwrap();
        Ok(tickers
            .iter()
            .filter_map(|t| {
                dividends.get(t).map(|payments| {
                    let kept = payments
                        .iter()
                        .filter(|(d, _)| (start..=end).contains(d))
                        .copied()
                        .collect();
                    (t.clone(), kept)
                })
            })
            .collect())
    }
}
