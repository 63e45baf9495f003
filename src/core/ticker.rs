//! Ticker normalization and listing classification.
//!
//! Symbols are stored venue-qualified: domestic listings carry the `.SA`
//! suffix, foreign (US) listings are bare 1–5 letter symbols and currency
//! pairs contain `=`.

use serde::{Deserialize, Serialize};

pub const DOMESTIC_SUFFIX: &str = ".SA";
const BDR_SUFFIXES: [&str; 3] = ["32.SA", "34.SA", "35.SA"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickerKind {
    Domestic,
    Bdr,
    Foreign,
    Fx,
}

fn is_bare_foreign_symbol(ticker: &str) -> bool {
    (1..=5).contains(&ticker.len()) && ticker.chars().all(|c| c.is_ascii_uppercase())
}

/// Canonical form of a user supplied ticker.
pub fn normalize(raw: &str) -> String {
    let ticker = raw.trim().to_uppercase();
    if ticker.contains('=') || ticker.contains('.') || is_bare_foreign_symbol(&ticker) {
        ticker
    } else {
        format!("{ticker}{DOMESTIC_SUFFIX}")
    }
}

pub fn kind(ticker: &str) -> TickerKind {
    let ticker = ticker.trim().to_uppercase();
    if ticker.contains('=') {
        TickerKind::Fx
    } else if BDR_SUFFIXES.iter().any(|s| ticker.ends_with(s)) {
        TickerKind::Bdr
    } else if ticker.ends_with(DOMESTIC_SUFFIX) {
        TickerKind::Domestic
    } else if is_bare_foreign_symbol(&ticker) {
        TickerKind::Foreign
    } else {
        TickerKind::Domestic
    }
}

/// Whether values in this ticker are quoted in the foreign currency and need
/// the exchange rate applied.
pub fn is_foreign(ticker: &str) -> bool {
    kind(ticker) == TickerKind::Foreign
}
