//! Current value of an owner's positions.

use super::position::Position;
use super::ticker::{TickerKind, kind, normalize};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Cache,
    Live,
    /// Neither cache nor upstream had a price.
    AverageCost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionValuation {
    pub ticker: String,
    pub normalized_ticker: String,
    pub kind: TickerKind,
    pub average_cost: Decimal,
    pub quantity: Decimal,
    pub current_price: Decimal,
    pub price_source: PriceSource,
    pub invested_value: Decimal,
    pub current_value: Decimal,
    pub return_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetReturn {
    pub ticker: String,
    pub return_pct: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuationTotals {
    pub invested: Decimal,
    pub current: Decimal,
    pub total_return: Decimal,
    pub return_pct: Decimal,
    pub best_asset: Option<AssetReturn>,
    pub worst_asset: Option<AssetReturn>,
    pub exchange_rate: Decimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioValuation {
    pub owner: String,
    pub positions: Vec<PositionValuation>,
    pub totals: ValuationTotals,
}

/// `(current / invested - 1) * 100`, or zero when nothing was invested.
pub fn return_pct(invested: Decimal, current: Decimal) -> Decimal {
    if invested > Decimal::ZERO {
        (current / invested - Decimal::ONE) * Decimal::ONE_HUNDRED
    } else {
        Decimal::ZERO
    }
}

pub fn value_position(
    position: &Position,
    price: Decimal,
    source: PriceSource,
    exchange_rate: Decimal,
) -> PositionValuation {
    let normalized = normalize(&position.ticker);
    let kind = kind(&normalized);
    let conversion = if kind == TickerKind::Foreign {
        exchange_rate
    } else {
        Decimal::ONE
    };
    let invested_value = position.average_cost * position.quantity * conversion;
    let current_value = price * position.quantity * conversion;
    PositionValuation {
        ticker: position.ticker.trim().to_uppercase(),
        normalized_ticker: normalized,
        kind,
        average_cost: position.average_cost,
        quantity: position.quantity,
        current_price: price,
        price_source: source,
        invested_value,
        current_value,
        return_pct: return_pct(invested_value, current_value),
    }
}

pub fn summarize(
    owner: &str,
    positions: Vec<PositionValuation>,
    exchange_rate: Decimal,
    now: DateTime<Utc>,
) -> PortfolioValuation {
    let invested: Decimal = positions.iter().map(|p| p.invested_value).sum();
    let current: Decimal = positions.iter().map(|p| p.current_value).sum();

    let as_return = |p: &PositionValuation| AssetReturn {
        ticker: p.ticker.clone(),
        return_pct: p.return_pct,
    };
    let best_asset = positions.iter().max_by_key(|p| p.return_pct).map(as_return);
    let worst_asset = positions.iter().min_by_key(|p| p.return_pct).map(as_return);

    PortfolioValuation {
        owner: owner.to_string(),
        totals: ValuationTotals {
            invested,
            current,
            total_return: current - invested,
            return_pct: return_pct(invested, current),
            best_asset,
            worst_asset,
            exchange_rate,
            updated_at: now,
        },
        positions,
    }
}
