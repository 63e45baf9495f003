use super::{KEY_SEP, StoreError, join_key};
use chrono::{DateTime, NaiveDate, Utc};
use fjall::PartitionHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DividendRecord {
    pub owner: String,
    pub ticker: String,
    pub date: NaiveDate,
    pub amount_per_share: Decimal,
    pub quantity: i64,
    pub value: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Dividend payments received per owner, unique per (owner, ticker, date).
pub struct DividendCache {
    partition: PartitionHandle,
}

impl DividendCache {
    pub fn new(partition: PartitionHandle) -> Self {
        Self { partition }
    }

    fn key(owner: &str, ticker: &str, date: NaiveDate) -> String {
        join_key(&[owner, ticker, &date.format("%Y-%m-%d").to_string()])
    }

    /// Inserts `record` unless a payment for the same owner, ticker and date
    /// is already cached. Returns whether a row was written.
    pub fn insert_if_absent(&self, record: &DividendRecord) -> Result<bool, StoreError> {
        let key = Self::key(&record.owner, &record.ticker, record.date);
        if self.partition.contains_key(&key)? {
            return Ok(false);
        }
        self.partition.insert(key, serde_json::to_vec(record)?)?;
        Ok(true)
    }

    fn owner_records(&self, owner: &str) -> Result<Vec<DividendRecord>, StoreError> {
        let prefix = format!("{owner}{KEY_SEP}");
        let mut records = Vec::new();
        for item in self.partition.prefix(prefix) {
            let (_, value) = item?;
            records.push(serde_json::from_slice::<DividendRecord>(&value)?);
        }
        Ok(records)
    }

    /// Most recent `updated_at` among the owner's cached dividends.
    pub fn last_updated(&self, owner: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .owner_records(owner)?
            .into_iter()
            .map(|r| r.updated_at)
            .max())
    }

    /// Dividends paid on or after `since`, oldest first.
    pub fn list(&self, owner: &str, since: NaiveDate) -> Result<Vec<DividendRecord>, StoreError> {
        let mut records: Vec<_> = self
            .owner_records(owner)?
            .into_iter()
            .filter(|r| r.date >= since)
            .collect();
        records.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.ticker.cmp(&b.ticker)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn record(ticker: &str, date: NaiveDate, updated_hour: u32) -> DividendRecord {
        DividendRecord {
            owner: "alice".to_string(),
            ticker: ticker.to_string(),
            date,
            amount_per_share: dec!(0.5),
            quantity: 100,
            value: dec!(50),
            updated_at: Utc.with_ymd_and_hms(2024, 6, 1, updated_hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_insert_if_absent_skips_duplicates() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let cache = DividendCache::new(store.dividends_partition());
        let date = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();

        assert!(cache.insert_if_absent(&record("ITSA4", date, 10)).unwrap());
        assert!(!cache.insert_if_absent(&record("ITSA4", date, 11)).unwrap());

        let rows = cache.list("alice", NaiveDate::MIN).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            cache.last_updated("alice").unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_list_filters_by_date() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let cache = DividendCache::new(store.dividends_partition());

        let early = NaiveDate::from_ymd_opt(2022, 12, 1).unwrap();
        let late = NaiveDate::from_ymd_opt(2023, 3, 1).unwrap();
        cache.insert_if_absent(&record("ITSA4", late, 9)).unwrap();
        cache.insert_if_absent(&record("ITSA4", early, 9)).unwrap();

        let since = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        let rows = cache.list("alice", since).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, late);
        assert!(cache.last_updated("bob").unwrap().is_none());
    }
}
