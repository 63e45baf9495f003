//! Background loops that keep the cache warm.
//!
//! Three tokio tasks share one [`CancellationToken`]:
//!
//! * the continuous refresh runs the batch refresher every interval while a
//!   market window is open, and forces an exchange-rate quote every few
//!   cycles;
//! * the dividend refresh runs once a day at a fixed local time;
//! * the end-of-day refresh captures closing prices on business days.
//!
//! All waits are sliced so a loop never sleeps longer than
//! `max_sleep_secs` before re-reading the clock, and every slice also wakes
//! on cancellation.

use super::market::MarketData;
use super::refresher::RefreshStatus;
use chrono::{DateTime, NaiveTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub refresh_interval_secs: u64,
    /// Poll interval while the governor holds a pause.
    pub paused_poll_secs: u64,
    /// The exchange rate is forced every this many open-market cycles.
    pub dollar_every_cycles: u32,
    pub dividends_at: NaiveTime,
    pub end_of_day_at: NaiveTime,
    pub max_sleep_secs: u64,
    pub continuous_jitter_secs: (u64, u64),
    pub dividends_jitter_secs: (u64, u64),
    pub end_of_day_jitter_secs: (u64, u64),
    /// Run a price and a dividend refresh right after start.
    pub initial_refresh: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30 * 60,
            paused_poll_secs: 60,
            dollar_every_cycles: 10,
            dividends_at: NaiveTime::from_hms_opt(10, 30, 0).unwrap_or(NaiveTime::MIN),
            end_of_day_at: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            max_sleep_secs: 60 * 60,
            continuous_jitter_secs: (1, 8),
            dividends_jitter_secs: (3, 10),
            end_of_day_jitter_secs: (5, 15),
            initial_refresh: true,
        }
    }
}

/// Random delay in `[lo, hi]` seconds with millisecond resolution.
fn jitter((lo, hi): (u64, u64)) -> Duration {
    let (lo, hi) = (lo.min(hi) * 1000, lo.max(hi) * 1000);
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Sleeps `total` in slices of at most `max_slice`. Returns `false` as soon
/// as `cancel` fires.
async fn sleep_or_cancel(total: Duration, max_slice: Duration, cancel: &CancellationToken) -> bool {
    let mut remaining = total;
    loop {
        let slice = remaining.min(max_slice);
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(slice) => {}
        }
        remaining = remaining.saturating_sub(slice);
        if remaining.is_zero() {
            return true;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DailyJob {
    Dividends,
    EndOfDayPrices,
}

pub struct Scheduler {
    market: Arc<MarketData>,
    settings: SchedulerSettings,
}

/// Running loops. Dropping the handle leaves them running; call
/// [`shutdown`](Self::shutdown) to stop them.
pub struct SchedulerHandle {
    market: Arc<MarketData>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Cancels every loop and waits for them to exit. The market can be
    /// scheduled again afterwards.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        self.market.release_scheduler();
        info!("Scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(market: Arc<MarketData>, settings: SchedulerSettings) -> Self {
        Self { market, settings }
    }

    /// Spawns the loops. Returns `None` while any scheduler is already
    /// running over the same market.
    pub fn start(&self) -> Option<SchedulerHandle> {
        if !self.market.claim_scheduler() {
            warn!("Scheduler already running for this market, ignoring");
            return None;
        }

        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(4);
        if self.settings.initial_refresh {
            tasks.push(tokio::spawn(initial_refresh(
                self.market.clone(),
                cancel.clone(),
            )));
        }
        tasks.push(tokio::spawn(continuous_loop(
            self.market.clone(),
            self.settings.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(daily_loop(
            self.market.clone(),
            self.settings.clone(),
            DailyJob::Dividends,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(daily_loop(
            self.market.clone(),
            self.settings.clone(),
            DailyJob::EndOfDayPrices,
            cancel.clone(),
        )));
        info!(tasks = tasks.len(), "Scheduler started");

        Some(SchedulerHandle {
            market: self.market.clone(),
            cancel,
            tasks,
        })
    }
}

async fn initial_refresh(market: Arc<MarketData>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = async {
            let prices = market.refresh_prices().await;
            debug!(status = ?prices.status, "Initial price refresh done");
            let dividends = market.refresh_dividends().await;
            debug!(inserted = dividends.inserted, "Initial dividend refresh done");
        } => {}
    }
}

async fn continuous_loop(market: Arc<MarketData>, settings: SchedulerSettings, cancel: CancellationToken) {
    let max_slice = Duration::from_secs(settings.max_sleep_secs.max(1));
    if !sleep_or_cancel(jitter(settings.continuous_jitter_secs), max_slice, &cancel).await {
        return;
    }

    let interval = Duration::from_secs(settings.refresh_interval_secs);
    let paused_poll = Duration::from_secs(settings.paused_poll_secs);
    let mut cycles: u32 = 0;
    let mut was_open = None;
    loop {
        if market.governor().is_paused() {
            debug!(until = ?market.governor().paused_until(), "Rate limited, polling again later");
            if !sleep_or_cancel(paused_poll, max_slice, &cancel).await {
                return;
            }
            continue;
        }

        let open = market.calendar().is_market_open(market.clock().now());
        if was_open != Some(open) {
            info!(open, "Market status changed");
            was_open = Some(open);
        }
        if open {
            let outcome = market.refresh_prices().await;
            if outcome.status == RefreshStatus::Completed {
                debug!(updated = outcome.updated, "Continuous refresh cycle done");
            }
            cycles += 1;
            if cycles >= settings.dollar_every_cycles.max(1) {
                let rate = market.refresh_exchange_rate().await;
                debug!(%rate, "Periodic exchange rate refresh");
                cycles = 0;
            }
        }

        if !sleep_or_cancel(interval, max_slice, &cancel).await {
            return;
        }
    }
}

/// Waits until `target` by the market clock, re-reading the clock after each
/// slice.
async fn wait_until(
    market: &MarketData,
    target: DateTime<Utc>,
    max_slice: Duration,
    cancel: &CancellationToken,
) -> bool {
    loop {
        let remaining = (target - market.clock().now()).to_std().unwrap_or_default();
        if remaining.is_zero() {
            return !cancel.is_cancelled();
        }
        if !sleep_or_cancel(remaining.min(max_slice), max_slice, cancel).await {
            return false;
        }
    }
}

async fn daily_loop(
    market: Arc<MarketData>,
    settings: SchedulerSettings,
    job: DailyJob,
    cancel: CancellationToken,
) {
    let (at, business_days_only, spread) = match job {
        DailyJob::Dividends => (settings.dividends_at, false, settings.dividends_jitter_secs),
        DailyJob::EndOfDayPrices => (settings.end_of_day_at, true, settings.end_of_day_jitter_secs),
    };
    let max_slice = Duration::from_secs(settings.max_sleep_secs.max(1));
    if !sleep_or_cancel(jitter(spread), max_slice, &cancel).await {
        return;
    }

    loop {
        let next = market
            .calendar()
            .next_daily_run(market.clock().now(), at, business_days_only);
        info!(?job, %next, "Next daily run scheduled");
        if !wait_until(&market, next, max_slice, &cancel).await {
            return;
        }

        match job {
            DailyJob::Dividends => {
                let outcome = market.refresh_dividends().await;
                if !outcome.failed_owners.is_empty() {
                    warn!(failed = ?outcome.failed_owners, "Daily dividend refresh incomplete");
                }
            }
            DailyJob::EndOfDayPrices => {
                let outcome = market.refresh_prices_now().await;
                info!(status = ?outcome.status, updated = outcome.updated, "End-of-day price refresh done");
            }
        }
    }
}
