use crate::core::cache::Cache;
use crate::core::clock::{Clock, SystemClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

struct CacheValue<V> {
    value: V,
    expires_at: Option<DateTime<Utc>>,
}

/// In-memory cache backed by a HashMap. Expiry is measured against the
/// injected clock so callers can control time in tests.
pub struct MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    inner: Arc<Mutex<HashMap<K, CacheValue<V>>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K, V> Cache<K, V> for MemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().await;
        if let Some(entry) = cache.get(key) {
            if let Some(expiry) = entry.expires_at {
                if expiry <= self.clock.now() {
                    debug!("Cache entry expired for key: {:?}", key);
                    cache.remove(key);
                    return None;
                }
            }
            debug!("Cache HIT for key: {:?}", key);
            return Some(entry.value.clone());
        }
        debug!("Cache MISS for key: {:?}", key);
        None
    }

    async fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let expires_at = ttl.map(|duration| self.clock.now() + duration);
        let cache_value = CacheValue { value, expires_at };

        let mut cache = self.inner.lock().await;
        debug!("Cache PUT for key: {:?}", key);
        cache.insert(key, cache_value);
    }

    async fn remove(&self, key: &K) {
        let mut cache = self.inner.lock().await;
        cache.remove(key);
        debug!("Cache REMOVE for key: {:?}", key);
    }

    async fn remove_where(&self, pred: &(dyn for<'k> Fn(&'k K) -> bool + Send + Sync)) -> usize {
        let mut cache = self.inner.lock().await;
        let before = cache.len();
        cache.retain(|key, _| !pred(key));
        let removed = before - cache.len();
        debug!(removed, "Cache REMOVE matching entries");
        removed
    }

    async fn clear(&self) {
        let mut cache = self.inner.lock().await;
        cache.clear();
        debug!("Cache CLEAR");
    }
}
