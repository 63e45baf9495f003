//! Error types shared across the market data core.

use crate::store::StoreError;
use rust_decimal::Decimal;
use thiserror::Error;

/// Failure reported by a quote provider.
///
/// [`is_systemic`](Self::is_systemic) separates failures that say something
/// about one ticker from failures that say something about the upstream as a
/// whole. Only the latter feed the rate-limit governor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider has no data for the symbol. Candidate for delisting.
    #[error("Symbol not found: {0}")]
    NotFound(String),

    /// Explicit throttling signal (HTTP 429 or equivalent).
    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Request to provider timed out")]
    Timeout,

    /// Network failure, 5xx, or any other error not attributable to a symbol.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider answered with a body we could not interpret.
    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Whether the error should pause upstream access. Misreading an outage
    /// as a delisting would evict valid cache entries, so everything except
    /// `NotFound` counts.
    pub fn is_systemic(&self) -> bool {
        !matches!(self, ProviderError::NotFound(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if err.status() == Some(reqwest::StatusCode::TOO_MANY_REQUESTS) {
            ProviderError::RateLimited
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// Rejection raised by the exchange-rate plausibility guard. Logged, never
/// surfaced to readers of the rate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DollarRateError {
    #[error("Rejected implausible exchange rate {candidate} (previous {previous})")]
    PlausibilityRejected { candidate: Decimal, previous: Decimal },

    #[error("Exchange rate must be positive, got {0}")]
    NonPositive(Decimal),
}

/// Errors surfaced to callers of the market data API. Upstream trouble is
/// absorbed internally, so only caller mistakes and storage failures remain.
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Unknown owner: {0}")]
    UnknownOwner(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("Position source failed: {0}")]
    Positions(String),
}
