//! In-memory [`DispatchStore`] with the same observable semantics as the
//! Postgres store: linearizable claim CAS, soft-delete invisibility,
//! monotonically assigned ids. The finalization inserts can be made to
//! fail on demand to drive the compensation path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use uvd_db::{DispatchStore, PageResult, StoreError};
use uvd_schemas::{DeliveryTask, GrabLog, Order, UVehicle};

#[derive(Default)]
pub struct MemoryStore {
    orders: Mutex<HashMap<i64, Order>>,
    vehicles: Mutex<HashMap<i64, UVehicle>>,
    grab_logs: Mutex<HashMap<i64, GrabLog>>,
    delivery_tasks: Mutex<HashMap<i64, DeliveryTask>>,
    next_id: AtomicI64,
    fail_grab_log_insert: AtomicBool,
    fail_delivery_insert: AtomicBool,
}

fn injected_failure(what: &str) -> StoreError {
    StoreError::Db(sqlx::Error::Protocol(format!("injected {what} failure")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn assign_id(&self, requested: Option<i64>) -> i64 {
        match requested {
            Some(id) => {
                // Keep the assigner ahead of explicitly seeded ids.
                self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                id
            }
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        }
    }

    // -- seeding and inspection ------------------------------------------

    pub fn seed_order(&self, mut order: Order) -> i64 {
        let id = self.assign_id(order.id);
        order.id = Some(id);
        self.orders.lock().unwrap().insert(id, order);
        id
    }

    pub fn seed_vehicle(&self, mut vehicle: UVehicle) -> i64 {
        let id = self.assign_id(vehicle.id);
        vehicle.id = Some(id);
        self.vehicles.lock().unwrap().insert(id, vehicle);
        id
    }

    /// Raw row, tombstoned or not.
    pub fn order(&self, id: i64) -> Option<Order> {
        self.orders.lock().unwrap().get(&id).cloned()
    }

    /// Live grab logs for one order.
    pub fn grab_logs_for(&self, order_id: i64) -> Vec<GrabLog> {
        self.grab_logs
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.order_id == Some(order_id) && l.is_delete.unwrap_or(0) == 0)
            .cloned()
            .collect()
    }

    /// Live delivery tasks for one order.
    pub fn delivery_tasks_for(&self, order_id: i64) -> Vec<DeliveryTask> {
        self.delivery_tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.order_id == Some(order_id) && t.is_delete.unwrap_or(0) == 0)
            .cloned()
            .collect()
    }

    pub fn set_fail_grab_log_insert(&self, fail: bool) {
        self.fail_grab_log_insert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_delivery_insert(&self, fail: bool) {
        self.fail_delivery_insert.store(fail, Ordering::SeqCst);
    }

    pub fn soft_delete_order(&self, id: i64) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(&id) {
            order.is_delete = Some(1);
            order.updated_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl DispatchStore for MemoryStore {
    async fn pending_orders_page(
        &self,
        page: i64,
        page_size: i64,
    ) -> Result<PageResult<Order>, StoreError> {
        let page = page.max(1);
        let page_size = page_size.max(1);

        let mut pending: Vec<Order> = self
            .orders
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.status == Some(0) && o.is_delete.unwrap_or(0) == 0)
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total_items = pending.len() as i64;
        let total_pages = (total_items + page_size - 1) / page_size;
        let items = pending
            .into_iter()
            .skip(((page - 1) * page_size) as usize)
            .take(page_size as usize)
            .collect();

        Ok(PageResult {
            items,
            total_items,
            total_pages,
            current_page: page,
            page_size,
        })
    }

    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .lock()
            .unwrap()
            .get(&id)
            .filter(|o| o.is_delete.unwrap_or(0) == 0)
            .cloned())
    }

    async fn vehicle_by_id(&self, id: i64) -> Result<Option<UVehicle>, StoreError> {
        Ok(self
            .vehicles
            .lock()
            .unwrap()
            .get(&id)
            .filter(|v| v.is_delete.unwrap_or(0) == 0)
            .cloned())
    }

    async fn claim_order(
        &self,
        order_id: i64,
        uv_id: i64,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(&order_id) {
            Some(order)
                if order.version == Some(expected_version)
                    && order.is_delete.unwrap_or(0) == 0 =>
            {
                order.status = Some(1);
                order.uv_id = Some(uv_id);
                order.version = Some(expected_version + 1);
                order.updated_at = Some(now);
                Ok(())
            }
            _ => Err(StoreError::ClaimLost(order_id)),
        }
    }

    async fn rollback_claim(&self, order_id: i64) -> Result<u64, StoreError> {
        let mut orders = self.orders.lock().unwrap();
        match orders.get_mut(&order_id) {
            Some(order) if order.status == Some(1) => {
                order.status = Some(0);
                order.version = Some(0);
                order.uv_id = None;
                order.updated_at = Some(Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_grab_log(&self, log: &GrabLog) -> Result<i64, StoreError> {
        if self.fail_grab_log_insert.load(Ordering::SeqCst) {
            return Err(injected_failure("grab log insert"));
        }
        let id = self.assign_id(None);
        let mut row = log.clone();
        row.id = Some(id);
        self.grab_logs.lock().unwrap().insert(id, row);
        Ok(id)
    }

    async fn insert_delivery_task(&self, task: &DeliveryTask) -> Result<i64, StoreError> {
        if self.fail_delivery_insert.load(Ordering::SeqCst) {
            return Err(injected_failure("delivery task insert"));
        }
        let id = self.assign_id(None);
        let mut row = task.clone();
        row.id = Some(id);
        self.delivery_tasks.lock().unwrap().insert(id, row);
        Ok(id)
    }

    async fn remove_grab_log(&self, id: i64) -> Result<(), StoreError> {
        match self.grab_logs.lock().unwrap().get_mut(&id) {
            Some(row) => {
                row.is_delete = Some(1);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "uv_grab_log",
                id,
            }),
        }
    }

    async fn remove_delivery_task(&self, id: i64) -> Result<(), StoreError> {
        match self.delivery_tasks.lock().unwrap().get_mut(&id) {
            Some(row) => {
                row.is_delete = Some(1);
                Ok(())
            }
            None => Err(StoreError::NotFound {
                entity: "uv_delivery",
                id,
            }),
        }
    }

    async fn bulk_insert_orders(&self, orders: &[Order]) -> Result<Vec<i64>, StoreError> {
        Ok(orders.iter().map(|o| self.seed_order(o.clone())).collect())
    }

    async fn bulk_insert_vehicles(&self, vehicles: &[UVehicle]) -> Result<Vec<i64>, StoreError> {
        Ok(vehicles
            .iter()
            .map(|v| self.seed_vehicle(v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: i64, version: i32) -> Order {
        Order {
            id: Some(id),
            status: Some(0),
            version: Some(version),
            created_at: Some(Utc::now()),
            is_delete: Some(0),
            ..Order::default()
        }
    }

    #[tokio::test]
    async fn claim_cas_admits_one_winner() {
        let store = MemoryStore::new();
        store.seed_order(pending(1001, 1));

        store.claim_order(1001, 10, 1, Utc::now()).await.unwrap();
        let err = store.claim_order(1001, 20, 1, Utc::now()).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimLost(1001)));

        let row = store.order(1001).unwrap();
        assert_eq!((row.status, row.version, row.uv_id), (Some(1), Some(2), Some(10)));
    }

    #[tokio::test]
    async fn tombstoned_rows_are_invisible() {
        let store = MemoryStore::new();
        store.seed_order(pending(1001, 1));
        store.soft_delete_order(1001);

        assert!(store.order_by_id(1001).await.unwrap().is_none());
        let page = store.pending_orders_page(1, 100).await.unwrap();
        assert!(page.items.is_empty());
        assert!(matches!(
            store.claim_order(1001, 10, 1, Utc::now()).await,
            Err(StoreError::ClaimLost(_))
        ));
    }

    #[tokio::test]
    async fn rollback_poisons_the_version() {
        let store = MemoryStore::new();
        store.seed_order(pending(1001, 5));
        store.claim_order(1001, 10, 5, Utc::now()).await.unwrap();

        assert_eq!(store.rollback_claim(1001).await.unwrap(), 1);
        let row = store.order(1001).unwrap();
        assert_eq!((row.status, row.version, row.uv_id), (Some(0), Some(0), None));

        // Second rollback is a no-op.
        assert_eq!(store.rollback_claim(1001).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_faults_fail_inserts() {
        let store = MemoryStore::new();
        store.set_fail_delivery_insert(true);
        let err = store
            .insert_delivery_task(&DeliveryTask::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Db(_)));

        store.set_fail_delivery_insert(false);
        assert!(store.insert_delivery_task(&DeliveryTask::default()).await.is_ok());
    }

    #[tokio::test]
    async fn paging_is_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            let mut order = pending(100 + i, 1);
            order.created_at = Some(Utc::now() + chrono::Duration::seconds(i));
            store.seed_order(order);
        }

        let page = store.pending_orders_page(1, 2).await.unwrap();
        assert_eq!(page.total_items, 5);
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.items[0].id, Some(104));
        assert_eq!(page.items[1].id, Some(103));
    }
}
