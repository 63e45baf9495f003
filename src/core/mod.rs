//! Market data cache: services, policies and the facade that ties them together.

pub mod cache;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod dividends;
pub mod dollar;
pub mod error;
pub mod evolution;
pub mod governor;
pub mod log;
pub mod market;
pub mod position;
pub mod price;
pub mod refresher;
pub mod scheduler;
pub mod ticker;
pub mod valuation;

pub use clock::{Clock, SystemClock};
pub use error::{MarketDataError, ProviderError};
pub use market::{MarketData, MarketStatus};
pub use position::{Position, PositionStore, Scope};
pub use price::{PriceSeries, QuoteProvider};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerSettings};
