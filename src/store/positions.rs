use crate::core::position::{Position, PositionStore};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Position source backed by the owners listed in the configuration file.
#[derive(Default)]
pub struct ConfigPositionStore {
    owners: RwLock<BTreeMap<String, Vec<Position>>>,
}

impl ConfigPositionStore {
    pub fn new(owners: impl IntoIterator<Item = (String, Vec<Position>)>) -> Self {
        Self {
            owners: RwLock::new(owners.into_iter().collect()),
        }
    }

    pub fn replace_positions(&self, owner: &str, positions: Vec<Position>) {
        let mut owners = self.owners.write().unwrap_or_else(|p| p.into_inner());
        owners.insert(owner.to_string(), positions);
    }
}

#[async_trait]
impl PositionStore for ConfigPositionStore {
    async fn list_owner_ids(&self) -> Result<Vec<String>> {
        let owners = self.owners.read().unwrap_or_else(|p| p.into_inner());
        Ok(owners.keys().cloned().collect())
    }

    async fn get_latest_positions(&self, owner: &str) -> Result<Vec<Position>> {
        let owners = self.owners.read().unwrap_or_else(|p| p.into_inner());
        Ok(owners.get(owner).cloned().unwrap_or_default())
    }
}
