//! Per-vehicle claim client.
//!
//! One [`VehicleClient`] per vehicle id: it subscribes with a capability
//! filter, buffers incoming candidates in the per-vehicle KV hash, and
//! runs the claim loop that races other vehicles for each order through a
//! distributed lock and a version CAS. The winner publishes the
//! finalization task; the finalization handler persists grab-log and
//! delivery-task rows, compensating (and re-queuing the order) when either
//! insert fails.

mod cache;
mod client;
mod registry;

pub use cache::OrderCache;
pub use client::{ClientState, EndpointSet, VehicleClient, VehicleClientConfig, VehicleStats};
pub use registry::VehicleRegistry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VehicleError {
    #[error("vehicle {0} not found in store")]
    UnknownVehicle(i64),
    #[error("client is not in a startable state")]
    BadState,
    #[error(transparent)]
    Store(#[from] uvd_db::StoreError),
    #[error(transparent)]
    Kv(#[from] uvd_kv::KvError),
    #[error(transparent)]
    Payload(#[from] uvd_schemas::PayloadError),
    #[error(transparent)]
    Bus(#[from] uvd_bus::BusError),
}
