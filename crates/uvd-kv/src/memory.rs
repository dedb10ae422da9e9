//! Deterministic in-process KV engine.
//!
//! One mutex over the whole keyspace: every trait method is a single
//! critical section, which is what makes `set_nx_px` / `del_if_eq` /
//! `compare_and_swap` genuinely atomic here. Expiry is lazy — an expired
//! entry is removed the next time any operation touches it, and `keys`
//! filters expired entries out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::store::{KeyTtl, Kv};
use crate::KvError;

#[derive(Clone, Debug)]
enum Container {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Set(HashSet<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Container,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`Kv`] backend.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys. Test observability.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.map
            .lock()
            .expect("kv map poisoned")
            .values()
            .filter(|e| !e.expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> R,
    ) -> R {
        let mut map = self.map.lock().expect("kv map poisoned");
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.expired(now)) {
            map.remove(key);
        }
        f(map.get_mut(key))
    }

    fn upsert<R>(
        &self,
        key: &str,
        make: impl FnOnce() -> Container,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> R {
        let mut map = self.map.lock().expect("kv map poisoned");
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.expired(now)) {
            map.remove(key);
        }
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            value: make(),
            expires_at: None,
        });
        f(entry)
    }
}

fn wrong_type(key: &str) -> KvError {
    KvError::WrongType(key.to_string())
}

/// `*`-wildcard glob used by [`MemoryKv::keys`]. Supports the patterns the
/// core actually issues (`deadletter:*`, exact keys).
pub(crate) fn glob_match(pattern: &str, s: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == s;
    }
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !s.starts_with(part) {
                return false;
            }
            pos = part.len();
        } else if i == parts.len() - 1 {
            return s.len() >= pos && s[pos..].ends_with(part);
        } else {
            match s[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    // Pattern ended with '*': any tail matches.
    true
}

fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
    let start = norm(start);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Kv for MemoryKv {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut map = self.map.lock().expect("kv map poisoned");
        map.insert(
            key.to_string(),
            Entry {
                value: Container::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(e) => match &e.value {
                Container::Str(s) => Ok(Some(s.clone())),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut map = self.map.lock().expect("kv map poisoned");
        Ok(map.remove(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let now = Instant::now();
        let map = self.map.lock().expect("kv map poisoned");
        Ok(map
            .iter()
            .filter(|(_, e)| !e.expired(now))
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(KeyTtl::Missing),
            Some(e) => match e.expires_at {
                None => Ok(KeyTtl::NoExpiry),
                Some(at) => Ok(KeyTtl::Remaining(at.saturating_duration_since(Instant::now()))),
            },
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => {
                e.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.upsert(
            key,
            || Container::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Container::Hash(h) => {
                    h.insert(field.to_string(), value.to_string());
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(e) => match &e.value {
                Container::Hash(h) => Ok(h.get(field).cloned()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(HashMap::new()),
            Some(e) => match &e.value {
                Container::Hash(h) => Ok(h.clone()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => match &mut e.value {
                Container::Hash(h) => Ok(h.remove(field).is_some()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn hmset(
        &self,
        key: &str,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        self.upsert(
            key,
            || Container::Hash(HashMap::new()),
            |entry| match &mut entry.value {
                Container::Hash(h) => {
                    for (f, v) in entries {
                        h.insert(f.clone(), v.clone());
                    }
                    if let Some(t) = ttl {
                        entry.expires_at = Some(Instant::now() + t);
                    }
                    Ok(())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, KvError> {
        self.upsert(
            key,
            || Container::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Container::List(l) => {
                    l.push_front(value.to_string());
                    Ok(l.len())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, KvError> {
        self.upsert(
            key,
            || Container::List(VecDeque::new()),
            |entry| match &mut entry.value {
                Container::List(l) => {
                    l.push_back(value.to_string());
                    Ok(l.len())
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(e) => match &mut e.value {
                Container::List(l) => Ok(l.pop_front()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(None),
            Some(e) => match &mut e.value {
                Container::List(l) => Ok(l.pop_back()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Container::List(l) => Ok(match resolve_range(l.len(), start, stop) {
                    None => Vec::new(),
                    Some((a, b)) => l.iter().skip(a).take(b - a + 1).cloned().collect(),
                }),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.upsert(
            key,
            || Container::Set(HashSet::new()),
            |entry| match &mut entry.value {
                Container::Set(s) => Ok(s.insert(member.to_string())),
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => match &mut e.value {
                Container::Set(s) => Ok(s.remove(member)),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => match &e.value {
                Container::Set(s) => Ok(s.contains(member)),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Container::Set(s) => Ok(s.iter().cloned().collect()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, KvError> {
        self.upsert(
            key,
            || Container::ZSet(HashMap::new()),
            |entry| match &mut entry.value {
                Container::ZSet(z) => Ok(z.insert(member.to_string(), score).is_none()),
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(Vec::new()),
            Some(e) => match &e.value {
                Container::ZSet(z) => {
                    let mut members: Vec<(&String, &f64)> = z.iter().collect();
                    members.sort_by(|a, b| {
                        a.1.partial_cmp(b.1)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.0.cmp(b.0))
                    });
                    Ok(match resolve_range(members.len(), start, stop) {
                        None => Vec::new(),
                        Some((a, b)) => members[a..=b].iter().map(|(m, _)| (*m).clone()).collect(),
                    })
                }
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => match &mut e.value {
                Container::ZSet(z) => Ok(z.remove(member).is_some()),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(0),
            Some(e) => match &mut e.value {
                Container::ZSet(z) => {
                    let before = z.len();
                    z.retain(|_, score| *score < min || *score > max);
                    Ok(before - z.len())
                }
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.upsert(
            key,
            || Container::Str("0".to_string()),
            |entry| match &mut entry.value {
                Container::Str(s) => {
                    let current: i64 = s.parse().map_err(|_| KvError::BadValue {
                        key: key.to_string(),
                        reason: "not an integer".to_string(),
                    })?;
                    let next = current + delta;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            },
        )
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool, KvError> {
        self.with_entry(key, |entry| match entry {
            None => Ok(false),
            Some(e) => match &mut e.value {
                Container::Str(s) if s == expected => {
                    *s = new_value.to_string();
                    Ok(true)
                }
                Container::Str(_) => Ok(false),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, KvError> {
        let mut map = self.map.lock().expect("kv map poisoned");
        let now = Instant::now();
        if map.get(key).is_some_and(|e| e.expired(now)) {
            map.remove(key);
        }
        if map.contains_key(key) {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: Container::Str(value.to_string()),
                expires_at: Some(now + Duration::from_millis(ttl_ms)),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut map = self.map.lock().expect("kv map poisoned");
        let now = Instant::now();
        let matches = match map.get(key) {
            Some(e) if !e.expired(now) => matches!(&e.value, Container::Str(s) if s == expected),
            _ => false,
        };
        if matches {
            map.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl_expires() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(30))).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn hash_ops_and_key_ttl() {
        let kv = MemoryKv::new();
        kv.hset("h", "a", "1").await.unwrap();
        kv.hmset(
            "h",
            &[("b".into(), "2".into()), ("c".into(), "3".into())],
            Some(Duration::from_secs(60)),
        )
        .await
        .unwrap();

        let all = kv.hget_all("h").await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(matches!(kv.ttl("h").await.unwrap(), KeyTtl::Remaining(_)));

        assert!(kv.hdel("h", "a").await.unwrap());
        assert!(!kv.hdel("h", "a").await.unwrap());
        assert_eq!(kv.hget("h", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn wrong_container_type_is_an_error() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        assert!(matches!(kv.hget("k", "f").await, Err(KvError::WrongType(_))));
        assert!(matches!(kv.lpush("k", "x").await, Err(KvError::WrongType(_))));
    }

    #[tokio::test]
    async fn keys_pattern_filters_and_skips_expired() {
        let kv = MemoryKv::new();
        kv.set("deadletter:1", "a", None).await.unwrap();
        kv.set("deadletter:2", "b", Some(Duration::from_millis(10))).await.unwrap();
        kv.set("other", "c", None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let mut keys = kv.keys("deadletter:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["deadletter:1".to_string()]);
    }

    #[tokio::test]
    async fn list_and_set_and_zset_basics() {
        let kv = MemoryKv::new();
        kv.rpush("l", "a").await.unwrap();
        kv.rpush("l", "b").await.unwrap();
        kv.lpush("l", "z").await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["z", "a", "b"]);
        assert_eq!(kv.lpop("l").await.unwrap().as_deref(), Some("z"));
        assert_eq!(kv.rpop("l").await.unwrap().as_deref(), Some("b"));

        assert!(kv.sadd("s", "m").await.unwrap());
        assert!(!kv.sadd("s", "m").await.unwrap());
        assert!(kv.sismember("s", "m").await.unwrap());
        assert!(kv.srem("s", "m").await.unwrap());

        kv.zadd("z", "low", 1.0).await.unwrap();
        kv.zadd("z", "high", 9.0).await.unwrap();
        kv.zadd("z", "mid", 5.0).await.unwrap();
        assert_eq!(kv.zrange("z", 0, -1).await.unwrap(), vec!["low", "mid", "high"]);
        assert_eq!(kv.zrem_range_by_score("z", 0.0, 5.0).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn atomics() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("n", 1).await.unwrap(), 1);
        assert_eq!(kv.incr_by("n", 5).await.unwrap(), 6);

        kv.set("c", "old", None).await.unwrap();
        assert!(kv.compare_and_swap("c", "old", "new").await.unwrap());
        assert!(!kv.compare_and_swap("c", "old", "newer").await.unwrap());
        assert_eq!(kv.get("c").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn set_nx_px_only_first_wins_until_expiry() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx_px("lock", "a", 40).await.unwrap());
        assert!(!kv.set_nx_px("lock", "b", 40).await.unwrap());

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(kv.set_nx_px("lock", "b", 40).await.unwrap());
    }

    #[tokio::test]
    async fn del_if_eq_requires_matching_value() {
        let kv = MemoryKv::new();
        kv.set("k", "token-a", None).await.unwrap();
        assert!(!kv.del_if_eq("k", "token-b").await.unwrap());
        assert!(kv.del_if_eq("k", "token-a").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("deadletter:*", "deadletter:42"));
        assert!(!glob_match("deadletter:*", "orders:42"));
        assert!(glob_match("exact", "exact"));
        assert!(!glob_match("exact", "exact2"));
        assert!(glob_match("*:42", "deadletter:42"));
        assert!(glob_match("dead*42", "deadletter:42"));
        assert!(!glob_match("dead*43", "deadletter:42"));
    }
}
