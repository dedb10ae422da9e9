//! The narrow store seam the dispatch pipeline consumes.
//!
//! Implemented by [`PgStore`][crate::PgStore] for production and by the
//! testkit's in-memory store for deterministic end-to-end tests. Keeping
//! the pipeline on this trait (rather than on the full SQL surface) is
//! what lets the claim protocol be exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use uvd_schemas::{DeliveryTask, GrabLog, Order, UVehicle};

use crate::query::PageResult;
use crate::StoreError;

#[async_trait]
pub trait DispatchStore: Send + Sync {
    /// One page of pending (`status = 0`, live) orders, newest first.
    async fn pending_orders_page(
        &self,
        page: i64,
        page_size: i64,
    ) -> Result<PageResult<Order>, StoreError>;

    /// Live-row lookup; tombstoned rows are invisible.
    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError>;

    async fn vehicle_by_id(&self, id: i64) -> Result<Option<UVehicle>, StoreError>;

    /// The claim CAS: transition `status 0 → 1` attributing the order to
    /// `uv_id`, guarded on the pre-image `expected_version`. Zero affected
    /// rows (conflict or tombstone) is [`StoreError::ClaimLost`].
    async fn claim_order(
        &self,
        order_id: i64,
        uv_id: i64,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Compensation: return a claimed order to circulation. Sets
    /// `status = 0, version = 0, uv_id = NULL` — the zero version
    /// deliberately invalidates any in-flight CAS against the pre-image.
    /// Returns affected rows (0 when the order is no longer claimed).
    async fn rollback_claim(&self, order_id: i64) -> Result<u64, StoreError>;

    async fn insert_grab_log(&self, log: &GrabLog) -> Result<i64, StoreError>;

    async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<i64, StoreError>;

    /// Compensation cleanup of a just-inserted grab log.
    async fn remove_grab_log(&self, id: i64) -> Result<(), StoreError>;

    /// Compensation cleanup of a just-inserted delivery task.
    async fn remove_delivery_task(&self, id: i64) -> Result<(), StoreError>;

    /// Producer path: one multi-row insert, returns assigned ids.
    async fn bulk_insert_orders(&self, orders: &[Order]) -> Result<Vec<i64>, StoreError>;

    async fn bulk_insert_vehicles(&self, vehicles: &[UVehicle]) -> Result<Vec<i64>, StoreError>;
}
