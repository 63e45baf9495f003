use async_trait::async_trait;
use chrono::Duration;

/// Keyed cache with optional per-entry time to live.
#[async_trait]
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &K) -> Option<V>;
    async fn put(&self, key: K, value: V, ttl: Option<Duration>);
    async fn remove(&self, key: &K);

    /// Drops every entry whose key matches `pred`. Returns how many were dropped.
    async fn remove_where(&self, pred: &(dyn for<'k> Fn(&'k K) -> bool + Send + Sync)) -> usize;

    async fn clear(&self);
}
