//! KV cache client: the semantic containers the dispatch core leans on
//! (strings, hashes, lists, sets, sorted sets, TTLs) plus the distributed
//! lock, behind one [`Kv`] trait.
//!
//! Two backends:
//! - [`MemoryKv`] — deterministic in-process engine; single-node
//!   deployments and every test.
//! - [`RedisKv`] — thin mapping onto a shared Redis, one command per trait
//!   method, SCAN (never KEYS) for pattern listing.
//!
//! [`DistLock`] builds the token lock on top of the trait's `set_nx_px` /
//! `del_if_eq` primitives, so both backends get identical lock semantics.

mod lock;
mod memory;
mod redis_kv;
mod store;

pub use lock::DistLock;
pub use memory::MemoryKv;
pub use redis_kv::RedisKv;
pub use store::{KeyTtl, Kv};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// The backend is unreachable or the command failed at the transport.
    #[error("kv unavailable: {0}")]
    Unavailable(String),
    /// An operation hit a key holding a different container type.
    #[error("wrong container type for key {0}")]
    WrongType(String),
    /// `DistLock::acquire` lost the race for the lock key.
    #[error("lock contended: {0}")]
    LockContended(String),
    /// A stored value could not be interpreted (e.g. INCR on non-integer).
    #[error("bad value at {key}: {reason}")]
    BadValue { key: String, reason: String },
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        KvError::Unavailable(err.to_string())
    }
}
