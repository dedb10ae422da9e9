//! Distributed mutex on top of the KV primitives.
//!
//! Acquisition is SET NX PX with a fresh uuid token; release deletes only
//! when the stored token still matches, so a lock that expired and was
//! re-acquired by someone else is never released by the stale holder.
//! Dropping a held lock releases it best-effort on the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::{Kv, KvError};

pub struct DistLock {
    kv: Arc<dyn Kv>,
    key: String,
    token: String,
    ttl_ms: u64,
    held: Arc<AtomicBool>,
}

impl DistLock {
    pub fn new(kv: Arc<dyn Kv>, key: impl Into<String>, ttl_ms: u64) -> Self {
        Self {
            kv,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl_ms,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// One atomic acquisition attempt; `false` means someone else holds it.
    pub async fn try_lock(&self) -> Result<bool, KvError> {
        let won = self.kv.set_nx_px(&self.key, &self.token, self.ttl_ms).await?;
        if won {
            self.held.store(true, Ordering::SeqCst);
        }
        Ok(won)
    }

    /// Like [`try_lock`][Self::try_lock], but contention is an error —
    /// for callers that treat a busy lock as a skip condition.
    pub async fn acquire(&self) -> Result<(), KvError> {
        if self.try_lock().await? {
            Ok(())
        } else {
            Err(KvError::LockContended(self.key.clone()))
        }
    }

    /// Extend the expiry while held. Returns `false` if the key vanished
    /// (TTL ran out before the renewal).
    pub async fn renew(&self, ttl: Duration) -> Result<bool, KvError> {
        if !self.is_held() {
            return Ok(false);
        }
        self.kv.expire(&self.key, ttl).await
    }

    /// Token-compare release. Idempotent: releasing an unheld lock is a
    /// no-op.
    pub async fn unlock(&self) -> Result<(), KvError> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let released = self.kv.del_if_eq(&self.key, &self.token).await?;
        if !released {
            debug!(key = %self.key, "lock already expired at unlock");
        }
        Ok(())
    }
}

impl Drop for DistLock {
    fn drop(&mut self) {
        if !self.held.swap(false, Ordering::SeqCst) {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        // Release on the runtime when one is available; otherwise the TTL
        // reaps the key.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = kv.del_if_eq(&key, &token).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKv;

    fn kv() -> Arc<dyn Kv> {
        Arc::new(MemoryKv::new())
    }

    #[tokio::test]
    async fn concurrent_try_locks_one_winner() {
        let kv = kv();
        let a = DistLock::new(Arc::clone(&kv), "order_lock:1", 1000);
        let b = DistLock::new(Arc::clone(&kv), "order_lock:1", 1000);

        let (ra, rb) = tokio::join!(a.try_lock(), b.try_lock());
        let wins = [ra.unwrap(), rb.unwrap()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);
    }

    #[tokio::test]
    async fn acquire_reports_contention() {
        let kv = kv();
        let a = DistLock::new(Arc::clone(&kv), "order_lock:2", 1000);
        let b = DistLock::new(Arc::clone(&kv), "order_lock:2", 1000);

        a.acquire().await.unwrap();
        assert!(matches!(b.acquire().await, Err(KvError::LockContended(_))));
    }

    #[tokio::test]
    async fn unlock_releases_only_the_holder() {
        let kv = kv();
        let a = DistLock::new(Arc::clone(&kv), "order_lock:3", 50);
        assert!(a.try_lock().await.unwrap());

        // TTL runs out, another actor takes the lock.
        tokio::time::sleep(Duration::from_millis(90)).await;
        let b = DistLock::new(Arc::clone(&kv), "order_lock:3", 1000);
        assert!(b.try_lock().await.unwrap());

        // The stale holder's unlock must not evict the new holder.
        a.unlock().await.unwrap();
        let c = DistLock::new(Arc::clone(&kv), "order_lock:3", 1000);
        assert!(!c.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn drop_while_held_releases_the_key() {
        let kv = kv();
        {
            let a = DistLock::new(Arc::clone(&kv), "order_lock:4", 60_000);
            assert!(a.try_lock().await.unwrap());
        }
        // The drop release runs as a spawned task; give it a moment.
        let b = DistLock::new(Arc::clone(&kv), "order_lock:4", 1000);
        let mut acquired = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if b.try_lock().await.unwrap() {
                acquired = true;
                break;
            }
        }
        assert!(acquired, "dropped lock was never released");
    }

    #[tokio::test]
    async fn renew_extends_expiry_while_held() {
        let kv = kv();
        let a = DistLock::new(Arc::clone(&kv), "order_lock:5", 60);
        assert!(a.try_lock().await.unwrap());
        assert!(a.renew(Duration::from_secs(5)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still held past the original TTL.
        let b = DistLock::new(Arc::clone(&kv), "order_lock:5", 1000);
        assert!(!b.try_lock().await.unwrap());
        a.unlock().await.unwrap();
    }
}
