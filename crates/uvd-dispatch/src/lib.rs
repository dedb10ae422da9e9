//! Dispatch: sweep pending orders page by page and publish them as
//! capability-routed candidates.
//!
//! One cycle (driven from the scheduler): fetch a page of `status = 0`
//! orders newest-first, compose each into the keyed candidate payload
//! (addresses reverse-geocoded and cached), publish on E1 as a HEADERS
//! message keyed by `order_type_code`, then advance the page cursor,
//! wrapping past the last page.
//!
//! Re-publishing a still-pending order is deliberate: subscribers dedupe
//! via their per-vehicle hash, and the claim CAS makes the duplicate
//! harmless. A full publish queue just leaves the remainder for the next
//! cycle — the orders are still `status = 0` in the store.

mod geocode;

pub use geocode::{GeocodeError, Geocoder};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use uvd_bus::{BusError, Message, Publisher};
use uvd_db::DispatchStore;
use uvd_kv::Kv;
use uvd_schemas::payload::encode_candidates;
use uvd_schemas::{CandidateSummary, Order};

/// Hash caching reverse-geocode results, keyed by the WKT point.
const POINT_ADDRESS_KEY: &str = "point_address";
/// Fallback when reverse geocoding fails.
const UNKNOWN_ADDRESS: &str = "未知地址";

pub const VEHICLE_ORDERS_TOPIC: &str = "vehicle_orders";
pub const VEHICLE_ORDERS_CHANNEL: &str = "vehicle_orders";

pub struct OrderDispatcher {
    store: Arc<dyn DispatchStore>,
    kv: Arc<dyn Kv>,
    publisher: Arc<Publisher>,
    geocoder: Option<Geocoder>,
    page: AtomicI64,
    page_size: i64,
    published_total: AtomicU64,
}

impl OrderDispatcher {
    pub fn new(
        store: Arc<dyn DispatchStore>,
        kv: Arc<dyn Kv>,
        publisher: Arc<Publisher>,
        geocoder: Option<Geocoder>,
        page_size: i64,
    ) -> Self {
        Self {
            store,
            kv,
            publisher,
            geocoder,
            page: AtomicI64::new(1),
            page_size: page_size.max(1),
            published_total: AtomicU64::new(0),
        }
    }

    pub fn published_total(&self) -> u64 {
        self.published_total.load(Ordering::Relaxed)
    }

    pub fn current_page(&self) -> i64 {
        self.page.load(Ordering::Relaxed)
    }

    /// One sweep cycle; returns how many orders were published.
    pub async fn run_cycle(&self) -> anyhow::Result<usize> {
        let page = self.page.load(Ordering::SeqCst);
        let result = self.store.pending_orders_page(page, self.page_size).await?;

        if result.items.is_empty() {
            self.page.store(1, Ordering::SeqCst);
            return Ok(0);
        }

        let started = std::time::Instant::now();
        let mut published = 0usize;
        for order in &result.items {
            let Some(code) = order.order_type_code else {
                debug!(order_id = order.id, "order without type code skipped");
                continue;
            };
            let body = self.make_candidate_body(order).await?;

            let mut headers = BTreeMap::new();
            headers.insert("type".to_string(), code.to_string());
            headers.insert("channel".to_string(), VEHICLE_ORDERS_CHANNEL.to_string());

            match self.publisher.publish(Message::headers(
                VEHICLE_ORDERS_TOPIC,
                body.into_bytes(),
                headers,
            )) {
                Ok(()) => published += 1,
                Err(BusError::Overflow(bound)) => {
                    // Leave the rest for the next cron tick; the orders are
                    // still pending in the store.
                    warn!(bound, published, "publish queue full, cycle cut short");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.published_total
            .fetch_add(published as u64, Ordering::Relaxed);
        info!(
            page,
            total_pages = result.total_pages,
            published,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatch cycle done"
        );

        let next = if page >= result.total_pages { 1 } else { page + 1 };
        self.page.store(next, Ordering::SeqCst);
        Ok(published)
    }

    /// The keyed-object candidate payload for one order.
    pub async fn make_candidate_body(&self, order: &Order) -> anyhow::Result<String> {
        let pickup_address = match &order.pickup {
            Some(point) => self.resolve_address(point).await,
            None => UNKNOWN_ADDRESS.to_string(),
        };
        let delivery_address = match &order.delivery {
            Some(point) => self.resolve_address(point).await,
            None => UNKNOWN_ADDRESS.to_string(),
        };

        let summary = CandidateSummary {
            order_no: order.order_no.clone().unwrap_or_else(|| "NULL".into()),
            order_type: order.order_type.clone().unwrap_or_else(|| "未知".into()),
            pickup_address,
            delivery_address,
            published_at: order
                .created_at
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
            reward: order.reward.unwrap_or(0.0),
            distance: order.distance.unwrap_or(0),
            ttl_text: ttl_text(order),
        };

        let mut batch = BTreeMap::new();
        batch.insert(order.id.unwrap_or(0).to_string(), summary);
        Ok(encode_candidates(&batch)?)
    }

    /// Reverse geocode with indefinite KV caching under `point_address`.
    async fn resolve_address(&self, point: &str) -> String {
        match self.kv.hget(POINT_ADDRESS_KEY, point).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(err) => warn!(%err, "address cache read failed"),
        }

        let Some(geocoder) = &self.geocoder else {
            // Offline deployments show the raw point text.
            return point.to_string();
        };

        match geocoder.reverse_geocode(point).await {
            Ok(address) => {
                if let Err(err) = self.kv.hset(POINT_ADDRESS_KEY, point, &address).await {
                    warn!(%err, "address cache write failed");
                }
                address
            }
            Err(err) => {
                warn!(point, %err, "reverse geocode failed");
                UNKNOWN_ADDRESS.to_string()
            }
        }
    }
}

/// Remaining-time text: from `expire_time` when set, otherwise a random
/// window, matching what the merchant console shows for undated orders.
fn ttl_text(order: &Order) -> String {
    match order.expire_time {
        Some(expire) => {
            let secs = (expire - Utc::now()).num_seconds().max(0);
            format!("{secs}秒")
        }
        None => {
            let secs = rand::rng().random_range(60..3600);
            format!("{secs}秒")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use uvd_bus::BusConfig;
    use uvd_db::{PageResult, StoreError};
    use uvd_kv::MemoryKv;
    use uvd_schemas::{DeliveryTask, GrabLog, UVehicle};

    /// Pending orders only; enough store to drive the sweep.
    struct FakeStore {
        orders: Mutex<Vec<Order>>,
    }

    impl FakeStore {
        fn with_pending(count: i64) -> Self {
            let orders = (0..count)
                .map(|i| Order {
                    id: Some(1000 + i),
                    order_no: Some(format!("ORD-{i}")),
                    order_type: Some("四轮车,鲜花,鲜花配送车,保温箱".into()),
                    order_type_code: Some(701),
                    reward: Some(50.0),
                    distance: Some(5),
                    status: Some(0),
                    version: Some(1),
                    created_at: Some(Utc::now()),
                    ..Order::default()
                })
                .collect();
            Self {
                orders: Mutex::new(orders),
            }
        }
    }

    #[async_trait]
    impl DispatchStore for FakeStore {
        async fn pending_orders_page(
            &self,
            page: i64,
            page_size: i64,
        ) -> Result<PageResult<Order>, StoreError> {
            let orders = self.orders.lock().unwrap();
            let total_items = orders.len() as i64;
            let total_pages = (total_items + page_size - 1) / page_size;
            let start = ((page - 1) * page_size) as usize;
            let items = orders
                .iter()
                .skip(start)
                .take(page_size as usize)
                .cloned()
                .collect();
            Ok(PageResult {
                items,
                total_items,
                total_pages,
                current_page: page,
                page_size,
            })
        }

        async fn order_by_id(&self, _id: i64) -> Result<Option<Order>, StoreError> {
            Ok(None)
        }
        async fn vehicle_by_id(&self, _id: i64) -> Result<Option<UVehicle>, StoreError> {
            Ok(None)
        }
        async fn claim_order(
            &self,
            order_id: i64,
            _uv_id: i64,
            _expected_version: i32,
            _now: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            Err(StoreError::ClaimLost(order_id))
        }
        async fn rollback_claim(&self, _order_id: i64) -> Result<u64, StoreError> {
            Ok(0)
        }
        async fn insert_grab_log(&self, _log: &GrabLog) -> Result<i64, StoreError> {
            Ok(1)
        }
        async fn insert_delivery_task(&self, _task: &DeliveryTask) -> Result<i64, StoreError> {
            Ok(1)
        }
        async fn remove_grab_log(&self, _id: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn remove_delivery_task(&self, _id: i64) -> Result<(), StoreError> {
            Ok(())
        }
        async fn bulk_insert_orders(&self, _orders: &[Order]) -> Result<Vec<i64>, StoreError> {
            Ok(Vec::new())
        }
        async fn bulk_insert_vehicles(
            &self,
            _vehicles: &[UVehicle],
        ) -> Result<Vec<i64>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn dispatcher(store: FakeStore, page_size: i64) -> OrderDispatcher {
        let publisher = Arc::new(Publisher::new("inproc://dispatch-test", BusConfig::default()));
        OrderDispatcher::new(
            Arc::new(store),
            Arc::new(MemoryKv::new()),
            publisher,
            None,
            page_size,
        )
    }

    #[tokio::test]
    async fn cycle_publishes_each_pending_order() {
        let d = dispatcher(FakeStore::with_pending(3), 100);
        let published = d.run_cycle().await.unwrap();
        assert_eq!(published, 3);
        assert_eq!(d.published_total(), 3);
    }

    #[tokio::test]
    async fn page_cursor_advances_and_wraps() {
        let d = dispatcher(FakeStore::with_pending(5), 2);
        assert_eq!(d.current_page(), 1);

        d.run_cycle().await.unwrap();
        assert_eq!(d.current_page(), 2);
        d.run_cycle().await.unwrap();
        assert_eq!(d.current_page(), 3);
        // Last page wraps back to 1.
        d.run_cycle().await.unwrap();
        assert_eq!(d.current_page(), 1);
    }

    #[tokio::test]
    async fn empty_sweep_resets_cursor() {
        let d = dispatcher(FakeStore::with_pending(0), 100);
        let published = d.run_cycle().await.unwrap();
        assert_eq!(published, 0);
        assert_eq!(d.current_page(), 1);
    }

    #[tokio::test]
    async fn candidate_body_is_keyed_by_order_id() {
        let d = dispatcher(FakeStore::with_pending(0), 100);
        let order = Order {
            id: Some(1001),
            order_no: Some("ORD-X".into()),
            order_type: Some("四轮车,鲜花,鲜花配送车,保温箱".into()),
            order_type_code: Some(701),
            pickup: Some("POINT(116.4 39.9)".into()),
            delivery: Some("POINT(121.5 31.2)".into()),
            reward: Some(88.5),
            distance: Some(12),
            created_at: Some(Utc::now()),
            status: Some(0),
            version: Some(1),
            ..Order::default()
        };

        let body = d.make_candidate_body(&order).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        let entry = &value["1001"];
        assert_eq!(entry["订单编号"], "ORD-X");
        // No geocoder configured: the raw point text stands in.
        assert_eq!(entry["取货地点"], "POINT(116.4 39.9)");
        assert_eq!(entry["奖励金额"], 88.5);
    }

    #[tokio::test]
    async fn resolved_addresses_come_from_cache_when_present() {
        let store = FakeStore::with_pending(0);
        let kv = Arc::new(MemoryKv::new());
        kv.hset(POINT_ADDRESS_KEY, "POINT(116.4 39.9)", "北京市朝阳区")
            .await
            .unwrap();
        let publisher = Arc::new(Publisher::new("inproc://cache-test", BusConfig::default()));
        let d = OrderDispatcher::new(Arc::new(store), kv, publisher, None, 100);

        let order = Order {
            id: Some(7),
            pickup: Some("POINT(116.4 39.9)".into()),
            ..Order::default()
        };
        let body = d.make_candidate_body(&order).await.unwrap();
        assert!(body.contains("北京市朝阳区"), "{body}");
    }
}
