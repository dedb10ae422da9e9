//! Redis-backed [`Kv`]: one command per trait method.
//!
//! Connection handling is delegated to `redis::aio::ConnectionManager`
//! (auto-reconnect, multiplexed); a PING on connect surfaces a dead server
//! at startup rather than on first use. Pattern listing uses SCAN with a
//! cursor loop — KEYS is never issued.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::store::{KeyTtl, Kv};
use crate::KvError;

const SCAN_COUNT: usize = 1000;

/// Compare-and-delete used for token lock release.
const DEL_IF_EQ: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  return redis.call('del', KEYS[1])
else
  return 0
end
"#;

/// Compare-and-swap for plain string slots.
const CAS: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
  redis.call('set', KEYS[1], ARGV[2])
  return 1
else
  return 0
end
"#;

pub struct RedisKv {
    conn: ConnectionManager,
    del_if_eq: redis::Script,
    cas: redis::Script,
}

impl RedisKv {
    /// Connect and health-ping the server.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let mut conn = ConnectionManager::new(client).await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(KvError::Unavailable(format!("unexpected ping reply {pong}")));
        }
        Ok(Self {
            conn,
            del_if_eq: redis::Script::new(DEL_IF_EQ),
            cas: redis::Script::new(CAS),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        match ttl {
            Some(t) => conn.set_ex::<_, _, ()>(key, value, t.as_secs()).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().get(key).await?)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            out.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(out)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, KvError> {
        let ttl: i64 = self.conn().ttl(key).await?;
        Ok(match ttl {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::NoExpiry,
            secs => KeyTtl::Remaining(Duration::from_secs(secs.max(0) as u64)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        Ok(self.conn().expire(key, ttl.as_secs() as i64).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        self.conn().hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hmset(
        &self,
        key: &str,
        entries: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (f, v) in entries {
            pipe.hset(key, f, v).ignore();
        }
        if let Some(t) = ttl {
            pipe.expire(key, t.as_secs() as i64).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<usize, KvError> {
        Ok(self.conn().lpush(key, value).await?)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, KvError> {
        Ok(self.conn().rpush(key, value).await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().lpop(key, None).await?)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.conn().rpop(key, None).await?)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        Ok(self.conn().lrange(key, start as isize, stop as isize).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let added: i64 = self.conn().sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, KvError> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, KvError> {
        let added: i64 = self.conn().zadd(key, member, score).await?;
        Ok(added > 0)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, KvError> {
        Ok(self.conn().zrange(key, start as isize, stop as isize).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let removed: i64 = self.conn().zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> Result<usize, KvError> {
        let removed: i64 = self.conn().zrembyscore(key, min, max).await?;
        Ok(removed.max(0) as usize)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        Ok(self.conn().incr(key, delta).await?)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .cas
            .key(key)
            .arg(expected)
            .arg(new_value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let removed: i64 = self
            .del_if_eq
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }
}
