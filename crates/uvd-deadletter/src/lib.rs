//! Dead-letter subsystem: passive observation, TTL'd storage, archival.
//!
//! Observers tap configured bus endpoints raw (every frame, every
//! exchange). A frame whose body carries a decodable [`FrameHeader`] older
//! than the expiry threshold is written to `deadletter:{msg_id}` in the KV
//! store with a 24-hour TTL and a 1 MiB body cap. A periodic maintenance
//! pass archives records whose remaining TTL dropped below 12 hours to
//! dated JSON files on disk, deletes the KV entries, and keeps running
//! bookkeeping in the `deadletter_maintenance` hash. An archive directory
//! above 100 MiB raises an `[ALERT]` log line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use uvd_bus::{handler_fn, BusRouter, FrameHeader};
use uvd_kv::{KeyTtl, Kv};

/// Body cap per stored record.
const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Records live this long in the KV store.
const RECORD_TTL: Duration = Duration::from_secs(86_400);
/// Archive records whose remaining TTL is below this.
const ARCHIVE_THRESHOLD: Duration = Duration::from_secs(12 * 3600);
/// Alert when the archive directory exceeds this.
const ALERT_ARCHIVE_BYTES: u64 = 100 * 1024 * 1024;

const ERRORS_KEY: &str = "deadletter_errors";
const MAINTENANCE_KEY: &str = "deadletter_maintenance";

#[derive(Clone, Debug)]
pub struct DeadLetterConfig {
    /// Frame age (seconds) after which it counts as dead.
    pub expire_sec: i64,
    pub archive_dir: PathBuf,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            expire_sec: 300,
            archive_dir: PathBuf::from("/var/deadletter/"),
        }
    }
}

/// Outcome of one maintenance pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaintenanceReport {
    pub scanned: usize,
    pub archived: usize,
    pub failed: usize,
}

pub struct DeadLetterObserver {
    kv: Arc<dyn Kv>,
    cfg: DeadLetterConfig,
    observed: AtomicU64,
    stored: AtomicU64,
}

impl DeadLetterObserver {
    pub fn new(kv: Arc<dyn Kv>, cfg: DeadLetterConfig) -> Arc<Self> {
        Arc::new(Self {
            kv,
            cfg,
            observed: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        })
    }

    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// Register a raw tap on each endpoint.
    pub fn attach(self: &Arc<Self>, router: &BusRouter, endpoints: &[String]) {
        for endpoint in endpoints {
            let subscriber = router.subscriber(endpoint);
            let this = Arc::clone(self);
            subscriber.subscribe_raw(handler_fn(move |delivery| {
                let this = Arc::clone(&this);
                async move {
                    this.inspect_body(&delivery.body).await;
                }
            }));
            info!(endpoint = %endpoint, "dead-letter observer attached");
        }
    }

    /// Age-check one body; store it when it is dead. Bodies without a
    /// decodable header never participate. Returns whether it was stored.
    pub async fn inspect_body(&self, body: &[u8]) -> bool {
        self.observed.fetch_add(1, Ordering::Relaxed);
        let Some((header, payload)) = FrameHeader::decode(body) else {
            return false;
        };
        let age_sec = (Utc::now().timestamp_millis() - header.timestamp_ms) / 1000;
        if age_sec <= self.cfg.expire_sec {
            return false;
        }

        let key = record_key(header.msg_id);
        let data = String::from_utf8_lossy(&payload[..payload.len().min(MAX_BODY_BYTES)]);
        let entries = vec![
            ("timestamp".to_string(), header.timestamp_ms.to_string()),
            ("msg_id".to_string(), header.msg_id.to_string()),
            ("data".to_string(), data.into_owned()),
        ];
        match self.kv.hmset(&key, &entries, Some(RECORD_TTL)).await {
            Ok(()) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, age_sec, "dead letter stored");
                true
            }
            Err(err) => {
                warn!(key = %key, %err, "dead letter store failed");
                false
            }
        }
    }

    /// Archive aging records to disk and delete them from the KV store.
    pub async fn run_maintenance(&self) -> anyhow::Result<MaintenanceReport> {
        let keys = self.kv.keys("deadletter:*").await?;
        let mut report = MaintenanceReport {
            scanned: keys.len(),
            ..Default::default()
        };

        for key in keys {
            let due = match self.kv.ttl(&key).await? {
                KeyTtl::Remaining(left) => left < ARCHIVE_THRESHOLD,
                // No expiry should not happen; archive it rather than let
                // it sit forever.
                KeyTtl::NoExpiry => true,
                KeyTtl::Missing => false,
            };
            if !due {
                continue;
            }

            let data = self.kv.hget_all(&key).await?;
            match archive_to_disk(&self.cfg.archive_dir, &key, &data) {
                Ok(bytes) => {
                    if self.kv.del(&key).await? {
                        report.archived += 1;
                        debug!(key = %key, bytes, "dead letter archived");
                    } else {
                        report.failed += 1;
                        warn!(key = %key, "archived but KV delete failed");
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %key, %err, "archive failed");
                    let _ = self.kv.hset(ERRORS_KEY, &key, "archive_failed").await;
                }
            }
        }

        let entries = vec![
            ("last_run".to_string(), Utc::now().timestamp().to_string()),
            ("processed".to_string(), report.archived.to_string()),
            ("failed".to_string(), report.failed.to_string()),
        ];
        self.kv.hmset(MAINTENANCE_KEY, &entries, None).await?;

        let archive_bytes = dir_size(&self.cfg.archive_dir);
        if archive_bytes > ALERT_ARCHIVE_BYTES {
            error!(
                archive_mib = archive_bytes / 1024 / 1024,
                "[ALERT] dead-letter archive directory exceeds 100 MiB"
            );
        }

        if report.archived > 0 || report.failed > 0 {
            info!(
                scanned = report.scanned,
                archived = report.archived,
                failed = report.failed,
                "dead-letter maintenance done"
            );
        }
        Ok(report)
    }
}

pub fn record_key(msg_id: i32) -> String {
    format!("deadletter:{msg_id}")
}

/// `{dir}/{YYYYMMDD}_{key}.json`, pretty-printed. An empty result file
/// counts as a failure so a record is never deleted without a durable
/// copy.
fn archive_to_disk(
    dir: &Path,
    key: &str,
    data: &std::collections::HashMap<String, String>,
) -> anyhow::Result<u64> {
    std::fs::create_dir_all(dir)?;

    let date = Utc::now().format("%Y%m%d");
    let path = dir.join(format!("{date}_{key}.json"));
    let body = serde_json::to_string_pretty(data)?;
    std::fs::write(&path, &body)?;

    let written = std::fs::metadata(&path)?.len();
    if written == 0 {
        anyhow::bail!("archive file {} is empty", path.display());
    }
    Ok(written)
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
