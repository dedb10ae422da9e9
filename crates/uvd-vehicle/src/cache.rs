//! Per-vehicle candidate cache: one KV hash per vehicle, fields keyed by
//! order id. Fields carry no TTL of their own; the hash key is refreshed
//! on every write so an abandoned cache cannot outlive its owner by more
//! than the configured TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uvd_kv::{Kv, KvError};

pub struct OrderCache {
    kv: Arc<dyn Kv>,
    ttl: Duration,
}

impl OrderCache {
    pub fn new(kv: Arc<dyn Kv>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// `vehicle_orders:{uv_id}`.
    pub fn vehicle_key(uv_id: i64) -> String {
        format!("vehicle_orders:{uv_id}")
    }

    /// Store (or overwrite) one candidate. Overwriting is the dedupe for
    /// re-published orders.
    pub async fn cache_order(
        &self,
        uv_id: i64,
        order_id: &str,
        payload: &str,
    ) -> Result<(), KvError> {
        let key = Self::vehicle_key(uv_id);
        self.kv.hset(&key, order_id, payload).await?;
        self.kv.expire(&key, self.ttl).await?;
        Ok(())
    }

    pub async fn remove_order(&self, uv_id: i64, order_id: &str) -> Result<bool, KvError> {
        self.kv.hdel(&Self::vehicle_key(uv_id), order_id).await
    }

    pub async fn orders(&self, uv_id: i64) -> Result<HashMap<String, String>, KvError> {
        self.kv.hget_all(&Self::vehicle_key(uv_id)).await
    }

    /// Drop the whole cache (client shutdown).
    pub async fn clear(&self, uv_id: i64) -> Result<bool, KvError> {
        self.kv.del(&Self::vehicle_key(uv_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvd_kv::{KeyTtl, MemoryKv};

    fn cache() -> (Arc<MemoryKv>, OrderCache) {
        let kv = Arc::new(MemoryKv::new());
        let cache = OrderCache::new(kv.clone() as Arc<dyn Kv>, Duration::from_secs(1800));
        (kv, cache)
    }

    #[tokio::test]
    async fn caches_are_scoped_per_vehicle() {
        let (_, cache) = cache();
        cache.cache_order(10, "1001", "{}").await.unwrap();
        cache.cache_order(20, "1002", "{}").await.unwrap();

        assert_eq!(cache.orders(10).await.unwrap().len(), 1);
        assert!(cache.orders(10).await.unwrap().contains_key("1001"));
        assert!(!cache.orders(10).await.unwrap().contains_key("1002"));
    }

    #[tokio::test]
    async fn overwrite_dedupes_republished_orders() {
        let (_, cache) = cache();
        cache.cache_order(10, "1001", "v1").await.unwrap();
        cache.cache_order(10, "1001", "v2").await.unwrap();

        let orders = cache.orders(10).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders["1001"], "v2");
    }

    #[tokio::test]
    async fn key_carries_the_configured_ttl() {
        let (kv, cache) = cache();
        cache.cache_order(10, "1001", "{}").await.unwrap();
        let ttl = kv.ttl(&OrderCache::vehicle_key(10)).await.unwrap();
        assert!(matches!(ttl, KeyTtl::Remaining(d) if d <= Duration::from_secs(1800)));
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let (_, cache) = cache();
        cache.cache_order(10, "1001", "{}").await.unwrap();
        cache.cache_order(10, "1002", "{}").await.unwrap();

        assert!(cache.remove_order(10, "1001").await.unwrap());
        assert!(!cache.remove_order(10, "1001").await.unwrap());
        assert!(cache.clear(10).await.unwrap());
        assert!(cache.orders(10).await.unwrap().is_empty());
    }
}
