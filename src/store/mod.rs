pub mod dividends;
pub mod memory;
pub mod positions;
pub mod price_cache;
pub mod snapshots;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use serde::{Serialize, de::DeserializeOwned};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

pub use dividends::{DividendCache, DividendRecord};
pub use memory::MemoryCache;
pub use positions::ConfigPositionStore;
pub use price_cache::{PriceCacheStore, PriceRecord};
pub use snapshots::{EvolutionSnapshot, SnapshotStore};

const PRICE_CACHE_PARTITION: &str = "price_cache";
const DIVIDENDS_PARTITION: &str = "dividends_cache";
const SNAPSHOTS_PARTITION: &str = "evolution_snapshots";
const META_PARTITION: &str = "meta";

/// Separator between the parts of a composite key.
pub(crate) const KEY_SEP: char = '\0';

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Failed to encode or decode a stored value: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Corrupt key in partition {partition}")]
    CorruptKey { partition: &'static str },
}

/// The persisted source of truth: one fjall keyspace holding the price cache,
/// the dividends cache, the evolution snapshots and small metadata records.
pub struct Store {
    keyspace: Keyspace,
    price_cache: PartitionHandle,
    dividends: PartitionHandle,
    snapshots: PartitionHandle,
    meta: PartitionHandle,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        debug!(path = %path.display(), "Opening market data store");
        let keyspace = fjall::Config::new(path).open()?;

        let open = |name: &str| keyspace.open_partition(name, PartitionCreateOptions::default());
        let price_cache = open(PRICE_CACHE_PARTITION)?;
        let dividends = open(DIVIDENDS_PARTITION)?;
        let snapshots = open(SNAPSHOTS_PARTITION)?;
        let meta = open(META_PARTITION)?;

        Ok(Self {
            keyspace,
            price_cache,
            dividends,
            snapshots,
            meta,
        })
    }

    pub(crate) fn price_cache_partition(&self) -> PartitionHandle {
        self.price_cache.clone()
    }

    pub(crate) fn dividends_partition(&self) -> PartitionHandle {
        self.dividends.clone()
    }

    pub(crate) fn snapshots_partition(&self) -> PartitionHandle {
        self.snapshots.clone()
    }

    pub fn get_meta<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.meta.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

pub(crate) fn join_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEP);
        }
        key.push_str(part);
    }
    key
}

pub(crate) fn split_key(key: &[u8]) -> Option<Vec<String>> {
    let key = std::str::from_utf8(key).ok()?;
    Some(key.split(KEY_SEP).map(str::to_string).collect())
}
