//! Synthetic load: cron-driven order and vehicle factories.
//!
//! Not part of the correctness surface — these exist to exercise the
//! dispatch pipeline in demos and tests. Fields are randomized within the
//! ranges the merchant console produces; locations are forward-geocoded
//! once per district and cached indefinitely in the `geo` hash.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::{info, warn};

use uvd_db::DispatchStore;
use uvd_dispatch::Geocoder;
use uvd_kv::Kv;
use uvd_schemas::catalog::{codes_for_model, order_type, order_type_joined, VehicleModel};
use uvd_schemas::{Order, UVehicle, ORDER_TYPES};

/// Hash caching forward-geocode results, keyed by district text.
const GEO_KEY: &str = "geo";

/// Districts the generators draw from.
pub const LOCATIONS: &[&str] = &[
    "北京市朝阳区",
    "上海市浦东新区",
    "广州市天河区",
    "深圳市南山区",
    "成都市武侯区",
    "杭州市余杭区",
];

/// `ORD-{epoch_millis}-{4-digit random}`.
pub fn generate_order_number(rng: &mut impl Rng) -> String {
    format!(
        "ORD-{}-{}",
        Utc::now().timestamp_millis(),
        rng.random_range(1000..=9999)
    )
}

/// `UV-{epoch_millis}-{4-digit random}`.
pub fn generate_vehicle_code(rng: &mut impl Rng) -> String {
    format!(
        "UV-{}-{}",
        Utc::now().timestamp_millis(),
        rng.random_range(1000..=9999)
    )
}

/// A pending order with randomized business fields. Locations are left
/// unset; the producer fills them from the geo cache.
pub fn random_order(rng: &mut impl Rng) -> Order {
    let info = &ORDER_TYPES[rng.random_range(0..ORDER_TYPES.len())];
    let now = Utc::now();

    Order {
        order_no: Some(generate_order_number(rng)),
        merchant_id: Some(rng.random_range(1..=1000)),
        reward: Some((rng.random_range(10.0..500.0) * 100.0_f64).round() / 100.0),
        distance: Some(rng.random_range(1..=50)),
        status: Some(0),
        version: Some(1),
        order_type: order_type_joined(info.code),
        order_type_code: Some(info.code),
        expire_time: Some(now + ChronoDuration::hours(rng.random_range(1..=72))),
        created_at: Some(now),
        updated_at: Some(now),
        is_delete: Some(0),
        ..Order::default()
    }
}

/// A fresh idle vehicle of a random class, advertising every order type
/// its class serves.
pub fn random_vehicle(rng: &mut impl Rng) -> UVehicle {
    let model = match rng.random_range(1..=3) {
        1 => VehicleModel::Ground,
        2 => VehicleModel::Drone,
        _ => VehicleModel::Robot,
    };
    let codes = codes_for_model(model);
    let mut capabilities: Vec<&str> = codes
        .iter()
        .filter_map(|c| order_type(*c))
        .flat_map(|t| t.capabilities.split('/'))
        .collect();
    capabilities.sort_unstable();
    capabilities.dedup();

    let now = Utc::now();
    UVehicle {
        uv_code: Some(generate_vehicle_code(rng)),
        model_type: Some(model.code()),
        status: Some(0),
        battery: Some(rng.random_range(20..=100)),
        capabilities: Some(capabilities.join(",")),
        version: Some(1),
        supported_types: Some(
            codes
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        heartbeat_time: Some(now),
        created_at: Some(now),
        updated_at: Some(now),
        is_delete: Some(0),
        ..UVehicle::default()
    }
}

pub struct Producer {
    store: Arc<dyn DispatchStore>,
    kv: Arc<dyn Kv>,
    geocoder: Option<Geocoder>,
}

impl Producer {
    pub fn new(store: Arc<dyn DispatchStore>, kv: Arc<dyn Kv>, geocoder: Option<Geocoder>) -> Self {
        Self {
            store,
            kv,
            geocoder,
        }
    }

    /// Generate and bulk-insert `count` pending orders.
    pub async fn create_orders(&self, count: usize) -> anyhow::Result<Vec<i64>> {
        let specs: Vec<(Order, &str, &str)> = {
            let mut rng = rand::rng();
            (0..count)
                .map(|_| {
                    let order = random_order(&mut rng);
                    let pickup = LOCATIONS[rng.random_range(0..LOCATIONS.len())];
                    let delivery = LOCATIONS[rng.random_range(0..LOCATIONS.len())];
                    (order, pickup, delivery)
                })
                .collect()
        };

        let mut orders = Vec::with_capacity(specs.len());
        for (mut order, pickup, delivery) in specs {
            order.pickup = Some(self.resolve_location(pickup).await);
            order.delivery = Some(self.resolve_location(delivery).await);
            orders.push(order);
        }

        let started = std::time::Instant::now();
        let ids = self.store.bulk_insert_orders(&orders).await?;
        info!(
            count = ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            first_ids = ?ids.iter().take(10).collect::<Vec<_>>(),
            "orders created"
        );
        Ok(ids)
    }

    /// Generate and bulk-insert `count` idle vehicles.
    pub async fn create_vehicles(&self, count: usize) -> anyhow::Result<Vec<i64>> {
        let mut vehicles: Vec<UVehicle> = {
            let mut rng = rand::rng();
            (0..count).map(|_| random_vehicle(&mut rng)).collect()
        };
        for vehicle in &mut vehicles {
            let district = {
                let mut rng = rand::rng();
                LOCATIONS[rng.random_range(0..LOCATIONS.len())]
            };
            vehicle.location = Some(self.resolve_location(district).await);
        }

        let ids = self.store.bulk_insert_vehicles(&vehicles).await?;
        info!(count = ids.len(), "vehicles created");
        Ok(ids)
    }

    /// Forward geocode with indefinite caching under the `geo` hash. With
    /// no geocoder configured a deterministic synthetic point stands in.
    async fn resolve_location(&self, address: &str) -> String {
        match self.kv.hget(GEO_KEY, address).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(err) => warn!(%err, "geo cache read failed"),
        }

        let point = match &self.geocoder {
            Some(geocoder) => match geocoder.geocode(address).await {
                Ok(point) => point,
                Err(err) => {
                    warn!(address, %err, "geocode failed, using synthetic point");
                    synthetic_point(address)
                }
            },
            None => synthetic_point(address),
        };

        if let Err(err) = self.kv.hset(GEO_KEY, address, &point).await {
            warn!(%err, "geo cache write failed");
        }
        point
    }
}

/// Stable pseudo-coordinates inside the China bounding box, derived from
/// the address text so repeated runs agree without a geocoder.
fn synthetic_point(address: &str) -> String {
    let hash: u32 = address
        .bytes()
        .fold(2166136261u32, |acc, b| (acc ^ b as u32).wrapping_mul(16777619));
    let lng = 73.0 + (hash % 10_000) as f64 / 10_000.0 * (135.0 - 73.0);
    let lat = 18.0 + ((hash / 10_000) % 10_000) as f64 / 10_000.0 * (53.0 - 18.0);
    format!("POINT({lng:.6} {lat:.6})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_order_is_a_valid_pending_order() {
        let mut rng = rand::rng();
        for _ in 0..50 {
            let order = random_order(&mut rng);
            assert_eq!(order.status, Some(0));
            assert_eq!(order.version, Some(1));
            assert_eq!(order.is_delete, Some(0));

            let reward = order.reward.unwrap();
            assert!((10.0..=500.0).contains(&reward));
            // Two-decimal money.
            assert!((reward * 100.0 - (reward * 100.0).round()).abs() < 1e-9);

            let code = order.order_type_code.unwrap();
            assert_eq!(order.order_type, order_type_joined(code));
            assert!((1..=50).contains(&order.distance.unwrap()));
            assert!(order.expire_time.unwrap() > Utc::now());
        }
    }

    #[test]
    fn order_numbers_follow_the_wire_format() {
        let mut rng = rand::rng();
        let no = generate_order_number(&mut rng);
        let parts: Vec<&str> = no.split('-').collect();
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts.len(), 3);
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 4);
    }

    #[test]
    fn random_vehicle_supports_exactly_its_class() {
        let mut rng = rand::rng();
        for _ in 0..20 {
            let vehicle = random_vehicle(&mut rng);
            let model = VehicleModel::from_code(vehicle.model_type.unwrap()).unwrap();
            let expected: Vec<String> = codes_for_model(model)
                .iter()
                .map(i64::to_string)
                .collect();
            assert_eq!(
                vehicle.supported_types.as_deref().unwrap(),
                expected.join(",")
            );
            assert!((20..=100).contains(&vehicle.battery.unwrap()));
        }
    }

    #[test]
    fn synthetic_points_are_stable_and_in_bounds() {
        let a = synthetic_point("北京市朝阳区");
        let b = synthetic_point("北京市朝阳区");
        assert_eq!(a, b);

        let coords: Vec<f64> = a
            .trim_start_matches("POINT(")
            .trim_end_matches(')')
            .split(' ')
            .map(|v| v.parse().unwrap())
            .collect();
        assert!((73.0..=135.0).contains(&coords[0]));
        assert!((18.0..=53.0).contains(&coords[1]));
    }
}
