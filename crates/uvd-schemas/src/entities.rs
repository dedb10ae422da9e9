//! Row types for the four canonical tables.
//!
//! Every nullable column is an `Option`; the store skips `None` fields on
//! update, so partial updates are expressed by populating only the fields
//! that change. IDs are store-assigned and monotonically increasing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A merchant's delivery request (`uv_order`).
///
/// Mutated exclusively by the claim CAS and by delivery state transitions;
/// `version` starts at 1 and only moves under the CAS. `uv_id` stays NULL
/// until the order is claimed (`status >= 1`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: Option<i64>,
    /// Globally unique order number, `ORD-{epoch_millis}-{rand4}`.
    pub order_no: Option<String>,
    pub merchant_id: Option<i64>,
    /// Reward in currency units, kept to 2 decimals by the producers.
    pub reward: Option<f64>,
    /// Pickup geo point, WKT/WKB text.
    pub pickup: Option<String>,
    /// Delivery geo point, WKT/WKB text.
    pub delivery: Option<String>,
    pub distance: Option<i32>,
    /// 0 pending, 1 claimed, 2 delivering, 3 completed, 4 canceled.
    pub status: Option<i32>,
    pub version: Option<i32>,
    /// Comma-joined capability tuple, see [`crate::catalog::ORDER_TYPES`].
    pub order_type: Option<String>,
    /// Numeric routing key (101, 102, ...).
    pub order_type_code: Option<i64>,
    pub expire_time: Option<DateTime<Utc>>,
    /// Vehicle that claimed the order; NULL until claimed.
    pub uv_id: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Soft-delete tombstone: 0 live, 1 deleted.
    pub is_delete: Option<i32>,
}

impl Order {
    /// `true` when the row is visible to dispatch and claim queries.
    pub fn is_live(&self) -> bool {
        self.is_delete.unwrap_or(0) == 0
    }
}

/// A participating vehicle (`uv_vehicle`).
///
/// `supported_types` is the fundamental routing key: the comma-joined list
/// of `order_type_code` values this vehicle can serve.
#[derive(Clone, Debug, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct UVehicle {
    pub id: Option<i64>,
    pub uv_code: Option<String>,
    /// 1 ground, 2 drone, 3 robot.
    pub model_type: Option<i32>,
    /// 0 idle, 1 busy, 2 maintenance.
    pub status: Option<i32>,
    /// Battery percentage.
    pub battery: Option<i32>,
    /// Comma-joined capability tags (保温箱, 防震, ...).
    pub capabilities: Option<String>,
    /// Current location geo point.
    pub location: Option<String>,
    pub version: Option<i32>,
    /// Comma-joined `order_type_code` list, e.g. "101,102,301".
    pub supported_types: Option<String>,
    pub heartbeat_time: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_delete: Option<i32>,
}

/// Append-only audit record of a claim attempt (`uv_grab_log`).
///
/// The table is range-partitioned by `created_at`; partition maintenance
/// lives in the store crate.
#[derive(Clone, Debug, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct GrabLog {
    pub id: Option<i64>,
    pub order_id: Option<i64>,
    pub status: Option<i32>,
    pub uv_id: Option<i64>,
    /// 1 = success.
    pub result: Option<i32>,
    /// Copy of `order.reward` at claim time.
    pub bid_amount: Option<f64>,
    /// Milliseconds from claim decision to commit.
    pub response_time: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_delete: Option<i32>,
}

/// The work item generated when a claim completes (`uv_delivery`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: Option<i64>,
    pub order_id: Option<i64>,
    pub uv_id: Option<i64>,
    pub actual_distance: Option<i32>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 1 = started.
    pub status: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_delete: Option<i32>,
}
