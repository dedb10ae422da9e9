//! The `Kv` trait: every container operation the core consumes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::KvError;

/// Remaining lifetime of a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist.
    Missing,
    /// Key exists with no expiry.
    NoExpiry,
    /// Key exists and expires after this duration.
    Remaining(Duration),
}

/// The KV operation surface.
///
/// Semantics follow the Redis commands of the same names; the in-memory
/// backend implements the same observable behavior. Every method is a
/// suspension point — callers must not hold sync locks across them.
#[async_trait]
pub trait Kv: Send + Sync {
    // -- strings ----------------------------------------------------------

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Returns `true` when the key existed.
    async fn del(&self, key: &str) -> Result<bool, KvError>;
    /// Pattern listing with `*` wildcards. Implementations MUST use
    /// incremental scans, never a blocking whole-keyspace KEYS.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError>;
    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError>;
    /// Returns `true` when the key existed and the expiry was set.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    // -- hashes -----------------------------------------------------------

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError>;
    /// Multi-field write with an optional TTL applied to the whole key.
    async fn hmset(
        &self,
        key: &str,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    // -- lists ------------------------------------------------------------

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, KvError>;
    async fn rpush(&self, key: &str, value: &str) -> Result<usize, KvError>;
    async fn lpop(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError>;
    /// Inclusive range with negative-index-from-tail semantics.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;

    // -- sets -------------------------------------------------------------

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;

    // -- sorted sets ------------------------------------------------------

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, KvError>;
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize, KvError>;

    // -- atomics ----------------------------------------------------------

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;
    /// Atomic string compare-and-swap; `true` when the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool, KvError>;
    /// SET key value NX PX ttl_ms — the lock acquisition primitive.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, KvError>;
    /// Delete only when the stored value equals `expected` — the
    /// token-compare lock release primitive.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;
}
