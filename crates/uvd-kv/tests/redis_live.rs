//! Live-Redis smoke test for the RedisKv backend.
//!
//! Skipped by default; run with a server available:
//! `UVD_REDIS_URL=redis://127.0.0.1:6379/0 cargo test -p uvd-kv -- --include-ignored`

use std::sync::Arc;
use std::time::Duration;

use uvd_kv::{DistLock, KeyTtl, Kv, RedisKv};

fn url() -> String {
    std::env::var("UVD_REDIS_URL").expect(
        "redis tests require UVD_REDIS_URL; run: UVD_REDIS_URL=redis://127.0.0.1:6379/0 \
         cargo test -p uvd-kv -- --include-ignored",
    )
}

#[tokio::test]
#[ignore = "requires UVD_REDIS_URL; run with --include-ignored against a live server"]
async fn strings_hashes_and_scan() -> Result<(), uvd_kv::KvError> {
    let kv = RedisKv::connect(&url()).await?;

    kv.set("uvd_test:s", "v", Some(Duration::from_secs(30))).await?;
    assert_eq!(kv.get("uvd_test:s").await?.as_deref(), Some("v"));
    assert!(matches!(kv.ttl("uvd_test:s").await?, KeyTtl::Remaining(_)));

    kv.hset("uvd_test:h", "f", "1").await?;
    assert_eq!(kv.hget("uvd_test:h", "f").await?.as_deref(), Some("1"));

    let keys = kv.keys("uvd_test:*").await?;
    assert!(keys.len() >= 2, "scan missed test keys: {keys:?}");

    kv.del("uvd_test:s").await?;
    kv.del("uvd_test:h").await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires UVD_REDIS_URL; run with --include-ignored against a live server"]
async fn token_lock_round_trip() -> Result<(), uvd_kv::KvError> {
    let kv: Arc<dyn Kv> = Arc::new(RedisKv::connect(&url()).await?);

    let a = DistLock::new(Arc::clone(&kv), "uvd_test:lock", 2000);
    let b = DistLock::new(Arc::clone(&kv), "uvd_test:lock", 2000);
    assert!(a.try_lock().await?);
    assert!(!b.try_lock().await?);

    a.unlock().await?;
    assert!(b.try_lock().await?);
    b.unlock().await?;
    Ok(())
}
