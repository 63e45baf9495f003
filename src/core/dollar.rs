//! Exchange rate between the foreign and local currency.
//!
//! A single value guarded by an `RwLock`, persisted as the global price
//! record of the pair symbol so it is rebuilt from the store at startup.
//! New quotes are only accepted within a plausibility band around the
//! previous value.

use super::clock::Clock;
use super::error::DollarRateError;
use super::governor::RateLimitGovernor;
use super::position::Scope;
use super::price::QuoteProvider;
use crate::store::PriceCacheStore;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

pub const DEFAULT_PAIR: &str = "USDBRL=X";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DollarSettings {
    pub pair: String,
    pub default_rate: Decimal,
    pub freshness_secs: i64,
}

impl Default for DollarSettings {
    fn default() -> Self {
        Self {
            pair: DEFAULT_PAIR.to_string(),
            default_rate: dec!(5.8187),
            freshness_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DollarRate {
    pub rate: Decimal,
    /// `None` while running on the seed rate.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Accepts `candidate` only within [0.5x, 2x] of `previous`.
pub fn check_plausible(previous: Decimal, candidate: Decimal) -> Result<(), DollarRateError> {
    if candidate <= Decimal::ZERO {
        return Err(DollarRateError::NonPositive(candidate));
    }
    let low = previous * dec!(0.5);
    let high = previous * dec!(2);
    if candidate < low || candidate > high {
        return Err(DollarRateError::PlausibilityRejected {
            candidate,
            previous,
        });
    }
    Ok(())
}

pub struct DollarRateCache {
    current: RwLock<DollarRate>,
    settings: DollarSettings,
    prices: Arc<PriceCacheStore>,
    clock: Arc<dyn Clock>,
}

impl DollarRateCache {
    /// Rebuilds the cache from the persisted pair record, or seeds it with
    /// the default rate.
    pub fn load(settings: DollarSettings, prices: Arc<PriceCacheStore>, clock: Arc<dyn Clock>) -> Self {
        let current = match prices.get_record(&Scope::Global, &settings.pair) {
            Ok(Some(record)) if record.price > Decimal::ZERO => {
                debug!(rate = %record.price, "Loaded persisted exchange rate");
                DollarRate {
                    rate: record.price,
                    updated_at: Some(record.updated_at),
                }
            }
            Ok(_) => DollarRate {
                rate: settings.default_rate,
                updated_at: None,
            },
            Err(e) => {
                warn!(error = %e, "Could not read persisted exchange rate, using default");
                DollarRate {
                    rate: settings.default_rate,
                    updated_at: None,
                }
            }
        };
        Self {
            current: RwLock::new(current),
            settings,
            prices,
            clock,
        }
    }

    pub fn pair(&self) -> &str {
        &self.settings.pair
    }

    pub fn current(&self) -> DollarRate {
        *self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn rate(&self) -> Decimal {
        self.current().rate
    }

    pub fn is_fresh(&self) -> bool {
        let max_age = Duration::seconds(self.settings.freshness_secs);
        self.current()
            .updated_at
            .is_some_and(|at| self.clock.now() - at < max_age)
    }

    /// Applies the plausibility guard and, on acceptance, stores and persists
    /// the new rate.
    pub async fn offer(&self, candidate: Decimal) -> Result<DollarRate, DollarRateError> {
        let accepted = {
            let mut current = self.current.write().unwrap_or_else(|p| p.into_inner());
            check_plausible(current.rate, candidate)?;
            *current = DollarRate {
                rate: candidate,
                updated_at: Some(self.clock.now()),
            };
            *current
        };
        if let Err(e) = self.prices.upsert(&Scope::Global, &self.settings.pair, candidate).await {
            warn!(error = %e, "Failed to persist exchange rate");
        }
        Ok(accepted)
    }

    /// Fetches a new quote unless the cached one is fresh (and `force` is not
    /// set) or the governor is paused. Always returns the rate in effect
    /// afterwards; upstream trouble only leaves the previous value in place.
    pub async fn refresh(
        &self,
        provider: &dyn QuoteProvider,
        governor: &RateLimitGovernor,
        force: bool,
    ) -> Decimal {
        if governor.is_paused() {
            debug!("Rate limited, serving cached exchange rate");
            return self.rate();
        }
        if !force && self.is_fresh() {
            return self.rate();
        }

        match provider.fetch_current(&self.settings.pair).await {
            Ok(candidate) => {
                governor.record_success();
                match self.offer(candidate).await {
                    Ok(rate) => info!(rate = %rate.rate, "Exchange rate updated"),
                    Err(e) => warn!(error = %e, "Ignoring exchange rate quote"),
                }
            }
            Err(e) if e.is_systemic() => {
                warn!(error = %e, "Exchange rate fetch failed");
                governor.record_failure();
            }
            Err(e) => warn!(error = %e, "Exchange rate pair unavailable"),
        }
        self.rate()
    }
}
