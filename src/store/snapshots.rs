use super::{KEY_SEP, StoreError, join_key};
use crate::core::clock::Clock;
use chrono::{DateTime, NaiveDate, Utc};
use fjall::PartitionHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Persisted total portfolio value for one owner on one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionSnapshot {
    pub owner: String,
    pub date: NaiveDate,
    pub total_value: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Upsert-only log of evolution snapshots keyed by `owner \0 YYYY-MM-DD`, so a
/// prefix scan returns an owner's rows in date order.
pub struct SnapshotStore {
    partition: PartitionHandle,
    clock: Arc<dyn Clock>,
}

impl SnapshotStore {
    pub fn new(partition: PartitionHandle, clock: Arc<dyn Clock>) -> Self {
        Self { partition, clock }
    }

    fn key(owner: &str, date: NaiveDate) -> String {
        join_key(&[owner, &date.format("%Y-%m-%d").to_string()])
    }

    pub fn upsert(&self, owner: &str, date: NaiveDate, total_value: Decimal) -> Result<(), StoreError> {
        let snapshot = EvolutionSnapshot {
            owner: owner.to_string(),
            date,
            total_value,
            updated_at: self.clock.now(),
        };
        self.partition
            .insert(Self::key(owner, date), serde_json::to_vec(&snapshot)?)?;
        Ok(())
    }

    pub fn upsert_many(&self, owner: &str, points: &[(NaiveDate, Decimal)]) -> Result<(), StoreError> {
        for (date, value) in points {
            self.upsert(owner, *date, *value)?;
        }
        debug!(owner, count = points.len(), "Persisted evolution snapshots");
        Ok(())
    }

    /// All snapshots for `owner`, oldest first.
    pub fn list(&self, owner: &str) -> Result<Vec<EvolutionSnapshot>, StoreError> {
        let prefix = format!("{owner}{KEY_SEP}");
        let mut snapshots = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (_, value) = item?;
            snapshots.push(serde_json::from_slice(&value)?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::Store;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
    }

    #[test]
    fn test_upsert_overwrites_same_owner_and_date() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 10, 12, 0, 0).unwrap(),
        ));
        let snapshots = SnapshotStore::new(store.snapshots_partition(), clock.clone());

        snapshots.upsert("alice", day(3), dec!(1000)).unwrap();
        clock.advance(Duration::minutes(5));
        snapshots.upsert("alice", day(3), dec!(1010)).unwrap();

        let rows = snapshots.list("alice").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_value, dec!(1010));
        assert_eq!(rows[0].updated_at, clock.now());
    }

    #[test]
    fn test_list_is_date_ordered_and_owner_isolated() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 10, 12, 0, 0).unwrap(),
        ));
        let snapshots = SnapshotStore::new(store.snapshots_partition(), clock);

        snapshots
            .upsert_many("alice", &[(day(9), dec!(3)), (day(1), dec!(1)), (day(5), dec!(2))])
            .unwrap();
        snapshots.upsert("alicia", day(2), dec!(99)).unwrap();

        let dates: Vec<_> = snapshots.list("alice").unwrap().iter().map(|s| s.date).collect();
        assert_eq!(dates, vec![day(1), day(5), day(9)]);
        assert_eq!(snapshots.list("alicia").unwrap().len(), 1);
        assert!(snapshots.list("bob").unwrap().is_empty());
    }
}
