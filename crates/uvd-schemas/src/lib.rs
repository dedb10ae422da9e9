//! Shared row types, catalogs and wire payloads for the uv-dispatch pipeline.
//!
//! Everything here is plain data: no I/O, no runtime state. The entity
//! structs mirror the four tables exactly (every nullable column is an
//! `Option`), the catalogs are the fixed lookup tables behind
//! `order_type_code`, and the payload types are the JSON bodies that cross
//! the bus.

pub mod catalog;
pub mod entities;
pub mod payload;

pub use catalog::{OrderStatus, OrderTypeInfo, VehicleModel, VehicleStatus, ORDER_TYPES};
pub use entities::{DeliveryTask, GrabLog, Order, UVehicle};
pub use payload::{CandidateSummary, FinalizePayload, PayloadError};
