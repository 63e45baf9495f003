//! Historical portfolio value over a date range.
//!
//! Live computation pulls one batch of daily closes for every held ticker,
//! forward-fills them onto a date grid and sums the position values. Each
//! computed point is persisted as a snapshot, and those snapshots are what
//! gets served when the upstream is paused or failing. A smooth synthetic
//! curve exists for callers that explicitly ask for one; it is never
//! substituted silently.

use super::cache::Cache;
use super::clock::Clock;
use super::error::{MarketDataError, ProviderError};
use super::governor::RateLimitGovernor;
use super::position::Position;
use super::price::{PriceSeries, QuoteProvider};
use super::ticker::{is_foreign, normalize};
use crate::store::{MemoryCache, SnapshotStore};
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Longest range served; longer requests have their start moved forward.
    pub max_span_days: i64,
    /// Extra history requested before the start so the first grid date has
    /// a close to carry forward.
    pub lookback_days: i64,
    pub cache_ttl_secs: i64,
    pub synthetic_points: usize,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            max_span_days: 3 * 365,
            lookback_days: 14,
            cache_ttl_secs: 120,
            synthetic_points: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frequency {
    Daily,
    EveryThreeDays,
    /// Mondays only.
    Weekly,
}

impl Frequency {
    pub fn for_span(days: i64) -> Self {
        if days > 365 {
            Frequency::Weekly
        } else if days > 90 {
            Frequency::EveryThreeDays
        } else {
            Frequency::Daily
        }
    }
}

/// Grid dates for `[start, end]`. The end date is always the last entry.
pub fn date_grid(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    if start > end {
        return Vec::new();
    }
    let frequency = Frequency::for_span((end - start).num_days());
    let mut dates: Vec<NaiveDate> = match frequency {
        Frequency::Daily => start.iter_days().take_while(|d| *d <= end).collect(),
        Frequency::EveryThreeDays => start
            .iter_days()
            .step_by(3)
            .take_while(|d| *d <= end)
            .collect(),
        Frequency::Weekly => start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| d.weekday() == Weekday::Mon)
            .collect(),
    };
    if dates.last() != Some(&end) {
        dates.push(end);
    }
    dates
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionPoint {
    pub date: NaiveDate,
    pub value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvolutionSource {
    Live,
    Snapshot,
    Synthetic,
    /// Fewer than two points could be produced.
    InsufficientData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionResult {
    pub points: Vec<EvolutionPoint>,
    pub source: EvolutionSource,
    /// Anything other than a live computation.
    pub degraded: bool,
}

impl EvolutionResult {
    fn from_points(points: Vec<EvolutionPoint>, source: EvolutionSource) -> Self {
        if points.len() < 2 {
            return Self::insufficient();
        }
        Self {
            degraded: source != EvolutionSource::Live,
            points,
            source,
        }
    }

    pub fn insufficient() -> Self {
        Self {
            points: Vec::new(),
            source: EvolutionSource::InsufficientData,
            degraded: true,
        }
    }

    pub fn is_insufficient(&self) -> bool {
        self.source == EvolutionSource::InsufficientData
    }
}

/// Value of one series on each grid date: the latest observation on or
/// before the date, or the first observation for dates preceding it.
fn fill_forward(grid: &[NaiveDate], observations: &[(NaiveDate, Decimal)]) -> Option<Vec<Decimal>> {
    let first = observations.first()?.1;
    let mut values = Vec::with_capacity(grid.len());
    let mut idx = 0;
    let mut last = None;
    for date in grid {
        while idx < observations.len() && observations[idx].0 <= *date {
            last = Some(observations[idx].1);
            idx += 1;
        }
        values.push(last.unwrap_or(first));
    }
    Some(values)
}

/// Smoothstep curve from `start_value` to `end_value`, ending exactly on
/// `end_value`. Deterministic.
pub fn synthetic_evolution(
    start: NaiveDate,
    end: NaiveDate,
    start_value: Decimal,
    end_value: Decimal,
    num_points: usize,
) -> Vec<EvolutionPoint> {
    if start >= end {
        return vec![EvolutionPoint {
            date: end,
            value: end_value,
        }];
    }
    let days = (end - start).num_days();
    let points = (num_points as i64).min(days.max(2)).max(2);

    let mut dates: Vec<NaiveDate> = if days <= points {
        (0..=days).map(|i| start + Duration::days(i)).collect()
    } else {
        (0..points)
            .map(|i| start + Duration::days(i * days / (points - 1)))
            .collect()
    };
    if let Some(last) = dates.last_mut() {
        *last = end;
    }

    let span = Decimal::from(dates.len() as i64 - 1);
    let three = Decimal::from(3);
    let two = Decimal::from(2);
    let last_index = dates.len() - 1;
    dates
        .into_iter()
        .enumerate()
        .map(|(i, date)| {
            let value = if i == last_index {
                end_value
            } else {
                let p = Decimal::from(i as i64) / span;
                let curve = p * p * (three - two * p);
                (start_value + (end_value - start_value) * curve).round_dp(2)
            };
            EvolutionPoint { date, value }
        })
        .collect()
}

pub struct EvolutionCalculator {
    provider: Arc<dyn QuoteProvider>,
    snapshots: Arc<SnapshotStore>,
    governor: Arc<RateLimitGovernor>,
    settings: EvolutionSettings,
}

impl EvolutionCalculator {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        snapshots: Arc<SnapshotStore>,
        governor: Arc<RateLimitGovernor>,
        settings: EvolutionSettings,
    ) -> Self {
        Self {
            provider,
            snapshots,
            governor,
            settings,
        }
    }

    /// Validates the range and moves `start` forward to the maximum span.
    pub fn clamp_range(&self, start: NaiveDate, end: NaiveDate) -> Result<(NaiveDate, NaiveDate), MarketDataError> {
        if start > end {
            return Err(MarketDataError::InvalidRange(format!(
                "start {start} is after end {end}"
            )));
        }
        let earliest = end - Duration::days(self.settings.max_span_days);
        Ok((start.max(earliest), end))
    }

    #[instrument(name = "ComputeEvolution", skip(self, positions, exchange_rate))]
    pub async fn compute(
        &self,
        owner: &str,
        positions: &[Position],
        start: NaiveDate,
        end: NaiveDate,
        exchange_rate: Decimal,
    ) -> Result<EvolutionResult, MarketDataError> {
        let (start, end) = self.clamp_range(start, end)?;
        let grid = date_grid(start, end);

        if self.governor.is_paused() {
            info!("Rate limited, serving evolution from snapshots");
            return self.from_snapshots(owner, &grid);
        }
        if positions.is_empty() {
            return Ok(EvolutionResult::insufficient());
        }

        let tickers: Vec<String> = positions
            .iter()
            .map(|p| normalize(&p.ticker))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let history_start = start - Duration::days(self.settings.lookback_days);

        let history = match self.provider.fetch_batch_history(&tickers, history_start, end).await {
            Ok(history) => history,
            Err(ProviderError::NotFound(_)) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "History request failed, serving snapshots");
                self.governor.record_failure();
                return self.from_snapshots(owner, &grid);
            }
        };

        let has_observations = history.values().any(|s| s.observations().next().is_some());
        if !has_observations {
            warn!("No history returned for any ticker, serving snapshots");
            return self.from_snapshots(owner, &grid);
        }
        self.governor.record_success();

        let points = self.value_grid(positions, &history, &grid, exchange_rate);
        let persisted: Vec<_> = points.iter().map(|p| (p.date, p.value)).collect();
        if let Err(e) = self.snapshots.upsert_many(owner, &persisted) {
            warn!(error = %e, "Failed to persist evolution snapshots");
        }
        Ok(EvolutionResult::from_points(points, EvolutionSource::Live))
    }

    fn value_grid(
        &self,
        positions: &[Position],
        history: &HashMap<String, PriceSeries>,
        grid: &[NaiveDate],
        exchange_rate: Decimal,
    ) -> Vec<EvolutionPoint> {
        let mut totals = vec![Decimal::ZERO; grid.len()];
        for position in positions {
            let ticker = normalize(&position.ticker);
            let conversion = if is_foreign(&ticker) {
                exchange_rate
            } else {
                Decimal::ONE
            };
            let observations: Vec<_> = history
                .get(&ticker)
                .map(|s| s.observations().collect())
                .unwrap_or_default();
            let prices = fill_forward(grid, &observations).unwrap_or_else(|| {
                debug!(%ticker, "No history, valuing at average cost");
                vec![position.average_cost; grid.len()]
            });
            for (total, price) in totals.iter_mut().zip(prices) {
                *total += price * position.quantity * conversion;
            }
        }
        grid.iter()
            .zip(totals)
            .map(|(date, value)| EvolutionPoint {
                date: *date,
                value: value.round_dp(2),
            })
            .collect()
    }

    /// Persisted snapshots forward-filled onto the grid. Grid dates before
    /// the first snapshot are dropped rather than invented.
    fn from_snapshots(&self, owner: &str, grid: &[NaiveDate]) -> Result<EvolutionResult, MarketDataError> {
        let snapshots = self.snapshots.list(owner)?;
        if snapshots.is_empty() {
            info!(owner, "No evolution snapshots available");
            return Ok(EvolutionResult::insufficient());
        }
        let mut points = Vec::new();
        let mut idx = 0;
        let mut last = None;
        for date in grid {
            while idx < snapshots.len() && snapshots[idx].date <= *date {
                last = Some(snapshots[idx].total_value);
                idx += 1;
            }
            if let Some(value) = last {
                points.push(EvolutionPoint { date: *date, value });
            }
        }
        Ok(EvolutionResult::from_points(points, EvolutionSource::Snapshot))
    }

    /// Explicitly requested synthetic curve between two known values.
    pub fn synthetic(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        start_value: Decimal,
        end_value: Decimal,
    ) -> Result<EvolutionResult, MarketDataError> {
        let (start, end) = self.clamp_range(start, end)?;
        let points = synthetic_evolution(start, end, start_value, end_value, self.settings.synthetic_points);
        Ok(EvolutionResult::from_points(points, EvolutionSource::Synthetic))
    }
}

pub type EvolutionKey = (String, NaiveDate, NaiveDate);

/// Short-lived memo of evolution results keyed by (owner, start, end).
pub struct EvolutionResponseCache {
    inner: MemoryCache<EvolutionKey, EvolutionResult>,
    ttl: Duration,
}

impl EvolutionResponseCache {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            inner: MemoryCache::with_clock(clock),
            ttl,
        }
    }

    pub async fn get(&self, owner: &str, start: NaiveDate, end: NaiveDate) -> Option<EvolutionResult> {
        self.inner.get(&(owner.to_string(), start, end)).await
    }

    pub async fn put(&self, owner: &str, start: NaiveDate, end: NaiveDate, result: EvolutionResult) {
        self.inner
            .put((owner.to_string(), start, end), result, Some(self.ttl))
            .await;
    }

    /// Drops every cached range for `owner`.
    pub async fn invalidate_owner(&self, owner: &str) -> usize {
        self.inner.remove_where(&|(key_owner, _, _)| key_owner == owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::Store;
    use crate::test_support::{MockQuoteProvider, series};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use tempfile::{TempDir, tempdir};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    struct Fixture {
        _store: Store,
        clock: Arc<ManualClock>,
        snapshots: Arc<SnapshotStore>,
        governor: Arc<RateLimitGovernor>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 15, 0, 0).unwrap(),
        ));
        let snapshots = Arc::new(SnapshotStore::new(store.snapshots_partition(), clock.clone()));
        let governor = Arc::new(RateLimitGovernor::new(clock.clone(), 24));
        Fixture {
            _store: store,
            clock,
            snapshots,
            governor,
            _dir: dir,
        }
    }

    fn calculator(f: &Fixture, provider: Arc<MockQuoteProvider>) -> EvolutionCalculator {
        EvolutionCalculator::new(provider, f.snapshots.clone(), f.governor.clone(), EvolutionSettings::default())
    }

    fn petr4() -> Position {
        Position {
            ticker: "PETR4".to_string(),
            average_cost: dec!(20),
            quantity: dec!(100),
        }
    }

    #[test]
    fn test_grid_frequency() {
        let daily = date_grid(d(2024, 1, 1), d(2024, 1, 10));
        assert_eq!(daily.len(), 10);

        let three = date_grid(d(2024, 1, 1), d(2024, 6, 1));
        assert_eq!(three[1], d(2024, 1, 4));
        assert_eq!(*three.last().unwrap(), d(2024, 6, 1));

        let weekly = date_grid(d(2022, 1, 1), d(2024, 1, 3));
        assert!(weekly[..weekly.len() - 1].iter().all(|d| d.weekday() == Weekday::Mon));
        assert_eq!(*weekly.last().unwrap(), d(2024, 1, 3));

        assert_eq!(date_grid(d(2024, 1, 1), d(2024, 1, 1)), vec![d(2024, 1, 1)]);
    }

    #[test]
    fn test_fill_forward_backfills_leading_dates() {
        let grid = [d(2024, 1, 1), d(2024, 1, 2), d(2024, 1, 3), d(2024, 1, 4)];
        let obs = [(d(2024, 1, 2), dec!(10)), (d(2024, 1, 4), dec!(12))];
        assert_eq!(
            fill_forward(&grid, &obs).unwrap(),
            vec![dec!(10), dec!(10), dec!(10), dec!(12)]
        );
        assert!(fill_forward(&grid, &[]).is_none());
    }

    #[test]
    fn test_synthetic_curve() {
        let points = synthetic_evolution(d(2024, 1, 1), d(2024, 12, 31), dec!(1000), dec!(2000), 30);
        assert_eq!(points.len(), 30);
        assert_eq!(points[0].value, dec!(1000));
        assert_eq!(points[0].date, d(2024, 1, 1));
        assert_eq!(points.last().unwrap().value, dec!(2000));
        assert_eq!(points.last().unwrap().date, d(2024, 12, 31));
        assert!(points.windows(2).all(|w| w[0].value <= w[1].value));

        let short = synthetic_evolution(d(2024, 1, 1), d(2024, 1, 5), dec!(1), dec!(2), 30);
        assert_eq!(short.len(), 5);
    }

    #[tokio::test]
    async fn test_live_evolution_persists_snapshots() {
        let f = fixture();
        let provider = Arc::new(MockQuoteProvider::new().with_history(
            "PETR4.SA",
            series(&[(d(2024, 4, 28), dec!(20)), (d(2024, 5, 2), dec!(25))]),
        ));
        let calc = calculator(&f, provider);

        let result = calc
            .compute("alice", &[petr4()], d(2024, 5, 1), d(2024, 5, 3), dec!(5))
            .await
            .unwrap();
        assert_eq!(result.source, EvolutionSource::Live);
        assert!(!result.degraded);
        let values: Vec<_> = result.points.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![dec!(2000), dec!(2500), dec!(2500)]);
        assert_eq!(f.snapshots.list("alice").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_history_falls_back_to_average_cost() {
        let f = fixture();
        let provider = Arc::new(MockQuoteProvider::new().with_history(
            "AAPL",
            series(&[(d(2024, 5, 1), dec!(180))]),
        ));
        let calc = calculator(&f, provider);
        let aapl = Position {
            ticker: "AAPL".to_string(),
            average_cost: dec!(150),
            quantity: dec!(10),
        };

        let result = calc
            .compute("alice", &[petr4(), aapl], d(2024, 5, 1), d(2024, 5, 2), dec!(5))
            .await
            .unwrap();
        // 20 * 100 + 180 * 10 * 5
        assert_eq!(result.points[0].value, dec!(11000));
    }

    #[tokio::test]
    async fn test_single_point_is_insufficient() {
        let f = fixture();
        let provider = Arc::new(
            MockQuoteProvider::new().with_history("PETR4.SA", series(&[(d(2024, 5, 1), dec!(20))])),
        );
        let calc = calculator(&f, provider);

        let result = calc
            .compute("alice", &[petr4()], d(2024, 5, 1), d(2024, 5, 1), dec!(5))
            .await
            .unwrap();
        assert!(result.is_insufficient());
        assert!(result.degraded);
        assert!(result.points.is_empty());
    }

    #[tokio::test]
    async fn test_systemic_failure_serves_snapshots() {
        let f = fixture();
        f.snapshots
            .upsert_many("alice", &[(d(2024, 5, 2), dec!(100)), (d(2024, 5, 4), dec!(110))])
            .unwrap();
        let provider = Arc::new(MockQuoteProvider::new().with_history_error(ProviderError::RateLimited));
        let calc = calculator(&f, provider.clone());

        let result = calc
            .compute("alice", &[petr4()], d(2024, 5, 1), d(2024, 5, 5), dec!(5))
            .await
            .unwrap();
        assert_eq!(result.source, EvolutionSource::Snapshot);
        assert!(result.degraded);
        let points: Vec<_> = result.points.iter().map(|p| (p.date, p.value)).collect();
        assert_eq!(
            points,
            vec![
                (d(2024, 5, 2), dec!(100)),
                (d(2024, 5, 3), dec!(100)),
                (d(2024, 5, 4), dec!(110)),
                (d(2024, 5, 5), dec!(110)),
            ]
        );
        assert!(f.governor.is_paused());

        // Paused now: no further upstream calls.
        calc.compute("alice", &[petr4()], d(2024, 5, 1), d(2024, 5, 5), dec!(5))
            .await
            .unwrap();
        assert_eq!(provider.history_calls(), 1);
    }

    #[tokio::test]
    async fn test_no_snapshots_while_paused_is_insufficient() {
        let f = fixture();
        f.governor.record_failure();
        let calc = calculator(&f, Arc::new(MockQuoteProvider::new()));

        let result = calc
            .compute("alice", &[petr4()], d(2024, 5, 1), d(2024, 5, 5), dec!(5))
            .await
            .unwrap();
        assert!(result.is_insufficient());
    }

    #[tokio::test]
    async fn test_range_validation_and_clamp() {
        let f = fixture();
        let calc = calculator(&f, Arc::new(MockQuoteProvider::new()));

        assert!(matches!(
            calc.clamp_range(d(2024, 5, 2), d(2024, 5, 1)),
            Err(MarketDataError::InvalidRange(_))
        ));
        let (start, _) = calc.clamp_range(d(2015, 1, 1), d(2024, 5, 1)).unwrap();
        assert_eq!(start, d(2024, 5, 1) - Duration::days(1095));
    }

    #[tokio::test]
    async fn test_response_cache_ttl_and_invalidation() {
        let f = fixture();
        let cache = EvolutionResponseCache::new(f.clock.clone(), Duration::seconds(120));
        let result = EvolutionResult::insufficient();

        cache.put("alice", d(2024, 1, 1), d(2024, 2, 1), result.clone()).await;
        cache.put("alice", d(2024, 1, 1), d(2024, 3, 1), result.clone()).await;
        cache.put("bob", d(2024, 1, 1), d(2024, 2, 1), result.clone()).await;
        assert!(cache.get("alice", d(2024, 1, 1), d(2024, 2, 1)).await.is_some());

        assert_eq!(cache.invalidate_owner("alice").await, 2);
        assert!(cache.get("alice", d(2024, 1, 1), d(2024, 3, 1)).await.is_none());

        f.clock.advance(Duration::seconds(120));
        assert!(cache.get("bob", d(2024, 1, 1), d(2024, 2, 1)).await.is_none());
    }
}
