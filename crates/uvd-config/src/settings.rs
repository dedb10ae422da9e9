//! Typed views over the merged configuration tree.
//!
//! Every knob has a serde default so a partial file (or none at all) yields
//! a runnable configuration; `validate` rejects the handful of values that
//! would make a subsystem silently misbehave.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Root of the typed configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub kv: KvSettings,
    pub db: DbSettings,
    pub bus: BusSettings,
    pub claim: ClaimSettings,
    pub cache: CacheSettings,
    pub deadletter: DeadLetterSettings,
    pub partition: PartitionSettings,
    pub sched: SchedSettings,
    pub fleet: FleetSettings,
    pub producer: ProducerSettings,
    pub geocode: GeocodeSettings,
}

impl Settings {
    /// Environment wins over files for credentials-bearing values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(crate::ENV_DB_URL) {
            self.db.conn_str = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bus.max_queue_size == 0 {
            return Err(ConfigError::Invalid("bus.max_queue_size must be > 0".into()));
        }
        if self.bus.batch_size == 0 {
            return Err(ConfigError::Invalid("bus.batch_size must be > 0".into()));
        }
        if self.db.pool_size == 0 {
            return Err(ConfigError::Invalid("db.pool_size must be > 0".into()));
        }
        if self.sched.pool_size == 0 {
            return Err(ConfigError::Invalid("sched.pool_size must be > 0".into()));
        }
        Ok(())
    }
}

/// KV backend selection. `Memory` runs the in-process engine (single-node
/// deployments and tests); `Redis` is the shared production backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvMode {
    #[default]
    Memory,
    Redis,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSettings {
    pub mode: KvMode,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub pool_size: u32,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            mode: KvMode::Memory,
            host: "127.0.0.1".into(),
            port: 6379,
            password: None,
            db: 0,
            pool_size: 8,
        }
    }
}

impl KvSettings {
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{}@{}:{}/{}", pw, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DbSettings {
    /// Overridden by `UVD_DATABASE_URL` when set.
    pub conn_str: Option<String>,
    pub pool_size: u32,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            conn_str: None,
            pool_size: 10,
        }
    }
}

/// The three bus endpoints of the pipeline.
///
/// E1 carries the vehicle-orders stream, E2 order update/retry, E3 the
/// finalization task channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusEndpoints {
    pub e1: String,
    pub e2: String,
    pub e3: String,
}

impl Default for BusEndpoints {
    fn default() -> Self {
        Self {
            e1: "inproc://vehicle-orders".into(),
            e2: "inproc://order-update".into(),
            e3: "inproc://order-finalize".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub endpoints: BusEndpoints,
    pub max_queue_size: usize,
    pub send_timeout_ms: u64,
    pub batch_size: usize,
    /// In-flight bound on the underlying transport.
    pub hwm: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            endpoints: BusEndpoints::default(),
            max_queue_size: 10_000,
            send_timeout_ms: 200,
            batch_size: 50,
            hwm: 1000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimSettings {
    pub lock_ttl_ms: u64,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self { lock_ttl_ms: 1000 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// TTL of the per-vehicle candidate hash key.
    pub order_ttl_sec: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { order_ttl_sec: 1800 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSettings {
    /// Message age (seconds) before it counts as dead.
    pub expire_sec: i64,
    pub archive_dir: String,
}

impl Default for DeadLetterSettings {
    fn default() -> Self {
        Self {
            expire_sec: 300,
            archive_dir: "/var/deadletter/".into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionSettings {
    pub lookahead_months: u32,
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self { lookahead_months: 3 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedSettings {
    pub pool_size: usize,
}

impl Default for SchedSettings {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Vehicles the daemon hosts in-process at boot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub vehicle_ids: Vec<i64>,
}

/// Cron-driven synthetic load. Absent cron lines disable a generator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub order_cron: Option<String>,
    pub order_batch: usize,
    pub vehicle_cron: Option<String>,
    pub vehicle_batch: usize,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            order_cron: None,
            order_batch: 10,
            vehicle_cron: None,
            vehicle_batch: 5,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeSettings {
    /// Base URL of the geocoding HTTP service. Absent means "offline":
    /// addresses fall back to the raw point text.
    pub base_url: Option<String>,
}
