//! Layered YAML configuration for the dispatch services.
//!
//! Files merge in order (later overrides earlier, objects deep-merge,
//! arrays replace), the merged tree is canonicalized (sorted keys, compact
//! JSON) and hashed so the daemon can report exactly which configuration a
//! process is running, and the typed [`Settings`] view is decoded from the
//! merged tree with serde defaults for every knob.

mod settings;

pub use settings::{
    BusEndpoints, BusSettings, CacheSettings, ClaimSettings, DbSettings, DeadLetterSettings,
    FleetSettings, GeocodeSettings, KvMode, KvSettings, PartitionSettings, ProducerSettings,
    SchedSettings, Settings,
};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Environment variable that overrides `db.conn_str`.
pub const ENV_DB_URL: &str = "UVD_DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse yaml {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The merged configuration plus its canonical form and hash.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
    pub settings: Settings,
}

/// Load + merge YAML files in order, canonicalize, hash, and decode the
/// typed settings. Missing knobs take their documented defaults; unknown
/// keys are tolerated (they may belong to other deployments sharing the
/// file).
pub fn load_layered_yaml<P: AsRef<Path>>(paths: &[P]) -> Result<LoadedConfig, ConfigError> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let path = p.as_ref();
        let display = path.display().to_string();
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).map_err(|source| ConfigError::Parse {
                path: display.clone(),
                source,
            })?;
        let json_val = serde_json::to_value(yaml_val)
            .map_err(|e| ConfigError::Invalid(format!("yaml->json conversion failed: {e}")))?;
        deep_merge(&mut merged, json_val);
    }

    from_value(merged)
}

/// Build a [`LoadedConfig`] from an already-merged JSON tree. Used directly
/// by tests and by the daemon's `--config-json` escape hatch.
pub fn from_value(merged: Value) -> Result<LoadedConfig, ConfigError> {
    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    let mut settings: Settings = serde_json::from_value(merged.clone())
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    settings.apply_env_overrides();
    settings.validate()?;

    Ok(LoadedConfig {
        config_json: merged,
        canonical_json: canonical,
        config_hash: hash,
        settings,
    })
}

/// Deep-merge: objects merge recursively; arrays replaced; scalars overwritten.
fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}
