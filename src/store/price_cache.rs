use super::{StoreError, join_key, split_key};
use crate::core::clock::Clock;
use crate::core::position::Scope;
use chrono::{DateTime, Utc};
use fjall::PartitionHandle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub scope: Scope,
    pub ticker: String,
    pub price: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Persisted last-known prices, one record per (scope, ticker).
///
/// Writers serialize through `write_lock` so a batch refresh and an ad-hoc
/// single-ticker fetch never interleave their read-modify-write cycles.
/// Readers go straight to the partition, which serves snapshot reads.
pub struct PriceCacheStore {
    partition: PartitionHandle,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl PriceCacheStore {
    pub fn new(partition: PartitionHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            partition,
            write_lock: Mutex::new(()),
            clock,
        }
    }

    fn key(scope: &Scope, ticker: &str) -> String {
        join_key(&[&scope.key(), ticker])
    }

    pub fn get_record(&self, scope: &Scope, ticker: &str) -> Result<Option<PriceRecord>, StoreError> {
        match self.partition.get(Self::key(scope, ticker))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Looks up a ticker in `scope`, falling back to the global scope.
    pub fn get(&self, scope: &Scope, ticker: &str) -> Result<Option<Decimal>, StoreError> {
        Ok(self.lookup(scope, ticker)?.map(|record| record.price))
    }

    pub fn lookup(&self, scope: &Scope, ticker: &str) -> Result<Option<PriceRecord>, StoreError> {
        if let Some(record) = self.get_record(scope, ticker)? {
            debug!(%scope, ticker, "Price cache HIT");
            return Ok(Some(record));
        }
        if *scope != Scope::Global {
            if let Some(record) = self.get_record(&Scope::Global, ticker)? {
                debug!(ticker, "Price cache HIT in global scope");
                return Ok(Some(record));
            }
        }
        debug!(%scope, ticker, "Price cache MISS");
        Ok(None)
    }

    pub async fn upsert(&self, scope: &Scope, ticker: &str, price: Decimal) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(scope, ticker, price)
    }

    /// Writes refreshed prices under a single acquisition of the write lock.
    /// Each price lands in the global scope and in every owner scope that
    /// already holds the ticker, so owner records never fall behind a batch
    /// refresh. Returns the number of tickers written.
    pub async fn upsert_many(&self, updates: &[(String, Decimal)]) -> Result<usize, StoreError> {
        if updates.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let owned = self.owner_scopes()?;
        for (ticker, price) in updates {
            self.write(&Scope::Global, ticker, *price)?;
            for scope in owned.get(ticker).into_iter().flatten() {
                self.write(scope, ticker, *price)?;
            }
        }
        Ok(updates.len())
    }

    /// Owner scopes holding a record, keyed by ticker.
    fn owner_scopes(&self) -> Result<HashMap<String, Vec<Scope>>, StoreError> {
        let mut owned: HashMap<String, Vec<Scope>> = HashMap::new();
        for item in self.partition.iter() {
            let (key, _) = item?;
            let scope_and_ticker = split_key(&key).and_then(|parts| match parts.as_slice() {
                [scope, ticker] => Scope::from_key(scope).map(|scope| (scope, ticker.clone())),
                _ => None,
            });
            match scope_and_ticker {
                Some((Scope::Global, _)) => {}
                Some((scope, ticker)) => owned.entry(ticker).or_default().push(scope),
                None => {
                    return Err(StoreError::CorruptKey {
                        partition: "price_cache",
                    });
                }
            }
        }
        Ok(owned)
    }

    fn write(&self, scope: &Scope, ticker: &str, price: Decimal) -> Result<(), StoreError> {
        let record = PriceRecord {
            scope: scope.clone(),
            ticker: ticker.to_string(),
            price,
            updated_at: self.clock.now(),
        };
        self.partition
            .insert(Self::key(scope, ticker), serde_json::to_vec(&record)?)?;
        debug!(%scope, ticker, %price, "Price cache PUT");
        Ok(())
    }

    /// Removes `ticker` from every scope. Returns the number of records removed.
    pub async fn delete(&self, ticker: &str) -> Result<usize, StoreError> {
        self.delete_many(&[ticker.to_string()]).await
    }

    pub async fn delete_many(&self, tickers: &[String]) -> Result<usize, StoreError> {
        if tickers.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;
        let targets: BTreeSet<&str> = tickers.iter().map(String::as_str).collect();

        let mut doomed = Vec::new();
        for item in self.partition.iter() {
            let (key, _) = item?;
            let parts = split_key(&key).ok_or(StoreError::CorruptKey {
                partition: "price_cache",
            })?;
            if parts.len() == 2 && targets.contains(parts[1].as_str()) {
                doomed.push(key);
            }
        }

        for key in &doomed {
            self.partition.remove(key.clone())?;
        }
        debug!(removed = doomed.len(), "Price cache REMOVE");
        Ok(doomed.len())
    }

    pub fn records(&self) -> Result<Vec<PriceRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.partition.iter() {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    pub fn list_distinct_tickers(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.records()?.into_iter().map(|r| r.ticker).collect())
    }

    /// Prices visible from `scope` keyed by ticker. Owner-scoped records
    /// shadow global ones.
    pub fn all_prices(&self, scope: &Scope) -> Result<HashMap<String, Decimal>, StoreError> {
        let mut prices = HashMap::new();
        let mut owned = Vec::new();
        for record in self.records()? {
            if record.scope == Scope::Global {
                prices.insert(record.ticker, record.price);
            } else if record.scope == *scope {
                owned.push((record.ticker, record.price));
            }
        }
        prices.extend(owned);
        Ok(prices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::store::Store;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use tempfile::{TempDir, tempdir};

    fn price_store() -> (TempDir, Store, PriceCacheStore) {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 2, 14, 0, 0).unwrap(),
        ));
        let prices = PriceCacheStore::new(store.price_cache_partition(), clock);
        (dir, store, prices)
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_record_per_scope_and_ticker() {
        let (_dir, _store, prices) = price_store();

        prices.upsert(&Scope::Global, "PETR4.SA", dec!(25)).await.unwrap();
        prices.upsert(&Scope::Global, "PETR4.SA", dec!(26.5)).await.unwrap();

        assert_eq!(prices.records().unwrap().len(), 1);
        assert_eq!(prices.get(&Scope::Global, "PETR4.SA").unwrap(), Some(dec!(26.5)));
    }

    #[tokio::test]
    async fn test_owner_scope_falls_back_to_global() {
        let (_dir, _store, prices) = price_store();
        let alice = Scope::Owner("alice".to_string());

        prices.upsert(&Scope::Global, "AAPL", dec!(180)).await.unwrap();
        assert_eq!(prices.get(&alice, "AAPL").unwrap(), Some(dec!(180)));

        prices.upsert(&alice, "AAPL", dec!(181)).await.unwrap();
        assert_eq!(prices.get(&alice, "AAPL").unwrap(), Some(dec!(181)));
        assert_eq!(prices.get(&Scope::Global, "AAPL").unwrap(), Some(dec!(180)));
        assert!(prices.get(&alice, "MSFT").unwrap().is_none());

        let visible = prices.all_prices(&alice).unwrap();
        assert_eq!(visible.get("AAPL"), Some(&dec!(181)));
        assert_eq!(prices.all_prices(&Scope::Global).unwrap().get("AAPL"), Some(&dec!(180)));
    }

    #[tokio::test]
    async fn test_upsert_many_updates_owner_records_for_the_ticker() {
        let (_dir, _store, prices) = price_store();
        let alice = Scope::Owner("alice".to_string());
        let bob = Scope::Owner("bob".to_string());

        prices.upsert(&alice, "PETR4.SA", dec!(25)).await.unwrap();
        prices.upsert(&bob, "VALE3.SA", dec!(60)).await.unwrap();

        let written = prices
            .upsert_many(&[("PETR4.SA".to_string(), dec!(40))])
            .await
            .unwrap();

        assert_eq!(written, 1);
        assert_eq!(prices.get(&alice, "PETR4.SA").unwrap(), Some(dec!(40)));
        assert_eq!(prices.get(&Scope::Global, "PETR4.SA").unwrap(), Some(dec!(40)));
        assert_eq!(prices.get(&bob, "VALE3.SA").unwrap(), Some(dec!(60)));
        assert!(prices.get_record(&bob, "PETR4.SA").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_ticker_from_every_scope() {
        let (_dir, _store, prices) = price_store();
        let alice = Scope::Owner("alice".to_string());

        prices.upsert(&Scope::Global, "OIBR3.SA", dec!(1)).await.unwrap();
        prices.upsert(&alice, "OIBR3.SA", dec!(1.1)).await.unwrap();
        prices.upsert(&Scope::Global, "VALE3.SA", dec!(60)).await.unwrap();

        assert_eq!(prices.delete("OIBR3.SA").await.unwrap(), 2);
        assert_eq!(
            prices.list_distinct_tickers().unwrap(),
            BTreeSet::from(["VALE3.SA".to_string()])
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let (_dir, _store, prices) = price_store();
        let prices = Arc::new(prices);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let prices = Arc::clone(&prices);
                tokio::spawn(async move {
                    let ticker = format!("T{i}");
                    prices
                        .upsert(&Scope::Global, &ticker, Decimal::from(i))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(prices.list_distinct_tickers().unwrap().len(), 16);
    }
}
