//! Positions supplied by the owning application and the cache scope they map to.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub average_cost: Decimal,
    pub quantity: Decimal,
}

/// Ownership partition of a cached price.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Owner(String),
}

impl Scope {
    pub(crate) fn key(&self) -> String {
        match self {
            Scope::Global => "*".to_string(),
            Scope::Owner(owner) => format!("@{owner}"),
        }
    }

    pub(crate) fn from_key(key: &str) -> Option<Self> {
        if key == "*" {
            Some(Scope::Global)
        } else {
            key.strip_prefix('@').map(|owner| Scope::Owner(owner.to_string()))
        }
    }
}

impl Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Owner(owner) => write!(f, "owner:{owner}"),
        }
    }
}

/// Read access to the positions owned by the surrounding application.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn list_owner_ids(&self) -> Result<Vec<String>>;
    async fn get_latest_positions(&self, owner: &str) -> Result<Vec<Position>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_key_roundtrip() {
        for scope in [Scope::Global, Scope::Owner("alice".to_string())] {
            assert_eq!(Scope::from_key(&scope.key()), Some(scope));
        }
        assert_eq!(Scope::from_key("bogus"), None);
    }
}
