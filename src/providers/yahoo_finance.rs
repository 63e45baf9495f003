use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

use crate::core::error::ProviderError;
use crate::core::price::{DividendHistory, PriceSeries, QuoteProvider};

/// Chart requests in flight at once during a batch.
const MAX_CONCURRENT_REQUESTS: usize = 4;

#[derive(Deserialize, Debug)]
struct YahooChartResponse {
    chart: ChartResult,
}

#[derive(Deserialize, Debug)]
struct ChartResult {
    result: Option<Vec<ChartItem>>,
}

#[derive(Deserialize, Debug)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Deserialize, Debug)]
struct Quote {
    close: Option<Vec<Option<f64>>>,
}

#[derive(Deserialize, Debug)]
struct ChartItem {
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Option<Indicators>,
    events: Option<ChartEvents>,
}

#[derive(Deserialize, Debug)]
struct ChartMeta {
    #[serde(alias = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    /// Exchange offset from UTC in seconds.
    gmtoffset: Option<i64>,
}

#[derive(Deserialize, Debug)]
struct ChartEvents {
    dividends: Option<HashMap<String, DividendEvent>>,
}

#[derive(Deserialize, Debug)]
struct DividendEvent {
    amount: f64,
    date: i64,
}

fn to_decimal(value: f64) -> Option<Decimal> {
    if value.is_finite() {
        Decimal::from_f64(value)
    } else {
        None
    }
}

/// Trading date of a bar, in the exchange's own offset.
fn to_date(timestamp: i64, gmtoffset: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp + gmtoffset, 0).map(|dt| dt.date_naive())
}

fn day_start(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

impl ChartItem {
    fn series(&self) -> PriceSeries {
        let offset = self.meta.gmtoffset.unwrap_or_default();
        let closes = match (
            self.timestamp.as_ref(),
            self.indicators
                .as_ref()
                .and_then(|inds| inds.quote.first())
                .and_then(|q| q.close.as_ref()),
        ) {
            (Some(timestamps), Some(closes)) => timestamps
                .iter()
                .zip(closes)
                .filter_map(|(ts, close)| {
                    to_date(*ts, offset).map(|date| (date, close.and_then(to_decimal)))
                })
                .collect(),
            _ => Vec::new(),
        };
        PriceSeries {
            current: self.meta.regular_market_price.and_then(to_decimal),
            closes,
        }
    }

    fn dividends(&self) -> Vec<(NaiveDate, Decimal)> {
        let offset = self.meta.gmtoffset.unwrap_or_default();
        let mut payments: Vec<(NaiveDate, Decimal)> = self
            .events
            .as_ref()
            .and_then(|e| e.dividends.as_ref())
            .map(|events| {
                events
                    .values()
                    .filter_map(|d| Some((to_date(d.date, offset)?, to_decimal(d.amount)?)))
                    .collect()
            })
            .unwrap_or_default();
        payments.sort_by_key(|(date, _)| *date);
        payments
    }
}

/// Quote provider backed by the Yahoo Finance chart API.
pub struct YahooQuoteProvider {
    base_url: String,
    client: reqwest::Client,
}

impl YahooQuoteProvider {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("marketcache/0.1")
            .timeout(timeout)
            .build()?;
        Ok(YahooQuoteProvider {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    #[instrument(name = "YahooChartFetch", skip(self, query), fields(symbol = %symbol))]
    async fn chart(&self, symbol: &str, query: &str) -> Result<ChartItem, ProviderError> {
        let url = format!("{}/v8/finance/chart/{}?{}", self.base_url, symbol, query);
        debug!("Requesting chart data from {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(symbol.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Transient(format!(
                "HTTP error: {status} for symbol: {symbol}"
            )));
        }

        let text = response.text().await?;
        let data: YahooChartResponse = serde_json::from_str(&text).map_err(|e| {
            ProviderError::Malformed(format!("Failed to parse JSON response for {symbol}: {e}"))
        })?;
        data.chart
            .result
            .and_then(|items| items.into_iter().next())
            .ok_or_else(|| ProviderError::NotFound(symbol.to_string()))
    }

    /// Runs `fetch` for every ticker, a few at a time. Tickers the provider
    /// does not know are dropped; any other error fails the whole batch.
    async fn fan_out<T, F, Fut>(&self, tickers: &[String], fetch: F) -> Result<HashMap<String, T>, ProviderError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = (String, Result<T, ProviderError>)>,
    {
        let mut results = HashMap::new();
        for chunk in tickers.chunks(MAX_CONCURRENT_REQUESTS) {
            let responses = join_all(chunk.iter().cloned().map(&fetch)).await;
            for (ticker, response) in responses {
                match response {
                    Ok(value) => {
                        results.insert(ticker, value);
                    }
                    Err(ProviderError::NotFound(_)) => debug!(ticker, "No data for ticker"),
                    Err(e) => {
                        warn!(ticker, error = %e, "Batch request failed");
                        return Err(e);
                    }
                }
            }
        }
        Ok(results)
    }
}

#[async_trait]
impl QuoteProvider for YahooQuoteProvider {
    async fn fetch_current(&self, ticker: &str) -> Result<Decimal, ProviderError> {
        let item = self.chart(ticker, "interval=1d&range=5d").await?;
        item.series()
            .resolve_price()
            .ok_or_else(|| ProviderError::NotFound(ticker.to_string()))
    }

    async fn fetch_batch_history(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<String, PriceSeries>, ProviderError> {
        let query = format!(
            "period1={}&period2={}&interval=1d",
            day_start(start),
            day_start(end + Duration::days(1))
        );
        self.fan_out(tickers, |ticker| {
            let query = query.clone();
            async move {
                let result = self.chart(&ticker, &query).await.map(|item| item.series());
                (ticker, result)
            }
        })
        .await
    }

    async fn fetch_dividends(
        &self,
        tickers: &[String],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<DividendHistory, ProviderError> {
        let query = format!(
            "period1={}&period2={}&interval=1d&events=div",
            day_start(start),
            day_start(end + Duration::days(1))
        );
        self.fan_out(tickers, |ticker| {
            let query = query.clone();
            async move {
                let result = self.chart(&ticker, &query).await.map(|item| item.dividends());
                (ticker, result)
            }
        })
        .await
    }
}
