//! Rate-limit governor shared by every path that talks to the upstream.
//!
//! A systemic failure opens a pause window of `backoff_hours` and doubles the
//! next window, up to a ceiling. Only an explicit success closes the cycle:
//! the window lapsing merely allows another attempt.
//!
//! Callers check [`RateLimitGovernor::is_paused`] and then act without holding
//! the lock, so two loops may both start work moments before one of them
//! records a failure. That is accepted; the governor is a throttle, not a
//! mutex.

use super::clock::Clock;
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

const STATE_KEY: &str = "rate_limit";
pub const DEFAULT_MAX_BACKOFF_HOURS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitState {
    pub paused_until: Option<DateTime<Utc>>,
    pub backoff_hours: u32,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            paused_until: None,
            backoff_hours: 1,
        }
    }
}

pub struct RateLimitGovernor {
    state: Mutex<RateLimitState>,
    max_backoff_hours: u32,
    clock: Arc<dyn Clock>,
    store: Option<Arc<Store>>,
}

impl RateLimitGovernor {
    /// In-memory governor, starting idle.
    pub fn new(clock: Arc<dyn Clock>, max_backoff_hours: u32) -> Self {
        Self {
            state: Mutex::new(RateLimitState::default()),
            max_backoff_hours: max_backoff_hours.max(1),
            clock,
            store: None,
        }
    }

    /// Governor backed by the store. Any persisted state is reloaded, so a
    /// pause survives a restart.
    pub fn restore(clock: Arc<dyn Clock>, max_backoff_hours: u32, store: Arc<Store>) -> Self {
        let state = match store.get_meta::<RateLimitState>(STATE_KEY) {
            Ok(Some(state)) => {
                info!(
                    paused_until = ?state.paused_until,
                    backoff_hours = state.backoff_hours,
                    "Restored rate limit state"
                );
                state
            }
            Ok(None) => RateLimitState::default(),
            Err(e) => {
                warn!(error = %e, "Could not read rate limit state, starting idle");
                RateLimitState::default()
            }
        };
        Self {
            state: Mutex::new(state),
            max_backoff_hours: max_backoff_hours.max(1),
            clock,
            store: Some(store),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RateLimitState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Rate limit mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn persist(&self, state: &RateLimitState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_meta(STATE_KEY, state) {
                warn!(error = %e, "Failed to persist rate limit state");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        let now = self.clock.now();
        self.lock_state()
            .paused_until
            .is_some_and(|until| now < until)
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        self.lock_state().paused_until
    }

    pub fn backoff_hours(&self) -> u32 {
        self.lock_state().backoff_hours
    }

    pub fn state(&self) -> RateLimitState {
        *self.lock_state()
    }

    /// Opens or extends the pause window and doubles the next backoff.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let snapshot = {
            let mut state = self.lock_state();
            let candidate = now + Duration::hours(i64::from(state.backoff_hours));
            let until = state.paused_until.map_or(candidate, |old| old.max(candidate));
            state.paused_until = Some(until);
            state.backoff_hours = state
                .backoff_hours
                .saturating_mul(2)
                .min(self.max_backoff_hours);
            *state
        };
        warn!(
            paused_until = ?snapshot.paused_until,
            next_backoff_hours = snapshot.backoff_hours,
            "Upstream rate limited, pausing requests"
        );
        self.persist(&snapshot);
    }

    pub fn record_success(&self) {
        let snapshot = {
            let mut state = self.lock_state();
            if *state == RateLimitState::default() {
                return;
            }
            *state = RateLimitState::default();
            *state
        };
        info!("Upstream healthy again, rate limit state reset");
        self.persist(&snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 6, 15, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_failure_pauses_for_backoff_hours() {
        let clock = clock();
        let governor = RateLimitGovernor::new(clock.clone(), DEFAULT_MAX_BACKOFF_HOURS);
        assert!(!governor.is_paused());

        governor.record_failure();
        assert!(governor.is_paused());
        assert_eq!(governor.backoff_hours(), 2);

        clock.advance(Duration::minutes(59));
        assert!(governor.is_paused());
        clock.advance(Duration::minutes(1));
        assert!(!governor.is_paused());
        // Expiry alone does not reset the backoff.
        assert_eq!(governor.backoff_hours(), 2);
    }

    #[test]
    fn test_second_failure_in_window_doubles_remaining() {
        let clock = clock();
        let governor = RateLimitGovernor::new(clock.clone(), DEFAULT_MAX_BACKOFF_HOURS);

        governor.record_failure();
        let first = governor.paused_until().unwrap();
        clock.advance(Duration::minutes(10));
        let remaining_before = first - clock.now();

        governor.record_failure();
        let second = governor.paused_until().unwrap();
        assert!(second >= first);
        assert!(second - clock.now() >= remaining_before * 2);
        assert_eq!(governor.backoff_hours(), 4);
    }

    #[test]
    fn test_success_resets() {
        let governor = RateLimitGovernor::new(clock(), DEFAULT_MAX_BACKOFF_HOURS);
        governor.record_failure();
        governor.record_failure();

        governor.record_success();
        assert!(!governor.is_paused());
        assert_eq!(governor.state(), RateLimitState::default());
    }

    #[test]
    fn test_backoff_is_capped() {
        let governor = RateLimitGovernor::new(clock(), 8);
        for _ in 0..10 {
            governor.record_failure();
        }
        assert_eq!(governor.backoff_hours(), 8);
    }

    #[test]
    fn test_state_survives_restart() {
        let dir = tempdir().unwrap();
        let clock = clock();
        let until = {
            let store = Arc::new(Store::open(dir.path()).unwrap());
            let governor = RateLimitGovernor::restore(clock.clone(), 24, store.clone());
            governor.record_failure();
            store.persist().unwrap();
            governor.paused_until()
        };

        let store = Arc::new(Store::open(dir.path()).unwrap());
        let governor = RateLimitGovernor::restore(clock, 24, store);
        assert!(governor.is_paused());
        assert_eq!(governor.paused_until(), until);
        assert_eq!(governor.backoff_hours(), 2);
    }
}
