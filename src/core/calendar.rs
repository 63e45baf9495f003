//! Trading calendar in the reference time zone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingWindow {
    pub name: String,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl TradingWindow {
    fn contains(&self, time: NaiveTime) -> bool {
        self.open <= time && time <= self.close
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarSettings {
    pub timezone: String,
    pub windows: Vec<TradingWindow>,
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for CalendarSettings {
    fn default() -> Self {
        Self {
            timezone: "America/Sao_Paulo".to_string(),
            windows: vec![
                TradingWindow {
                    name: "B3".to_string(),
                    open: hm(10, 0),
                    close: hm(17, 55),
                },
                TradingWindow {
                    name: "NYSE".to_string(),
                    open: hm(10, 30),
                    close: hm(17, 0),
                },
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketCalendar {
    tz: Tz,
    windows: Vec<TradingWindow>,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self {
            tz: chrono_tz::America::Sao_Paulo,
            windows: CalendarSettings::default().windows,
        }
    }
}

impl MarketCalendar {
    pub fn new(tz: Tz, windows: Vec<TradingWindow>) -> Self {
        Self { tz, windows }
    }

    pub fn from_settings(settings: &CalendarSettings) -> anyhow::Result<Self> {
        let tz: Tz = settings
            .timezone
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid time zone {}: {}", settings.timezone, e))?;
        Ok(Self::new(tz, settings.windows.clone()))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    fn local(&self, now: DateTime<Utc>) -> NaiveDateTime {
        now.with_timezone(&self.tz).naive_local()
    }

    /// Calendar date in the reference zone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        self.local(now).date()
    }

    /// UTC instant of a local wall-clock time. Times skipped by a DST jump
    /// resolve to the first valid instant after them.
    pub fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| self.tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        let local = self.local(now);
        self.is_business_day(local.date()) && self.windows.iter().any(|w| w.contains(local.time()))
    }

    /// Next instant at local time `at`, strictly after `now`.
    pub fn next_daily_run(&self, now: DateTime<Utc>, at: NaiveTime, business_days_only: bool) -> DateTime<Utc> {
        let mut date = self.local_date(now);
        loop {
            if !business_days_only || self.is_business_day(date) {
                let candidate = self.to_utc(date, at);
                if candidate > now {
                    return candidate;
                }
            }
            date = date.succ_opt().unwrap_or(date + Duration::days(1));
        }
    }

    /// `now` if any window is open, else the earliest upcoming window open.
    pub fn next_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_market_open(now) {
            return now;
        }
        let Some(first_open) = self.windows.iter().map(|w| w.open).min() else {
            return now;
        };
        let mut date = self.local_date(now);
        for _ in 0..8 {
            if self.is_business_day(date) {
                let candidate = self.to_utc(date, first_open);
                if candidate > now {
                    return candidate;
                }
            }
            date += Duration::days(1);
        }
        now
    }
}
