//! The vehicle client: subscriptions, claim loop, finalization.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use uvd_bus::{handler_fn, BusRouter, Delivery, ExchangeType, Message};
use uvd_db::{DispatchStore, StoreError};
use uvd_kv::{DistLock, Kv, KvError};
use uvd_schemas::payload::decode_candidates;
use uvd_schemas::{DeliveryTask, FinalizePayload, GrabLog};

use crate::cache::OrderCache;
use crate::registry::VehicleRegistry;
use crate::VehicleError;

const ORDER_LOG_TASK_TOPIC: &str = "order_log_task";
const ORDER_UPDATE_TOPIC: &str = "order_update";
const ORDER_RETRY_TOPIC: &str = "order_retry";
const VEHICLE_ORDERS_TOPIC: &str = "vehicle_orders";
const UPDATE_CHANNEL: &str = "update_orders";
const RETRY_CHANNEL: &str = "retry_orders";
const VEHICLE_ORDERS_CHANNEL: &str = "vehicle_orders";

/// Claim-loop timings.
const SHORT_SLEEP: Duration = Duration::from_millis(100);
const DEEP_SLEEP: Duration = Duration::from_secs(5);
const MAX_IDLE_CYCLES: u32 = 5;
/// Bound on joining the claim loop at stop; past it the task is detached.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// ClientState
// ---------------------------------------------------------------------------

/// Lifecycle of a client process. Message delivery is honored only in
/// `Running` and `Idle`; `Stopping` drops handler work on the floor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Created = 0,
    Started = 1,
    Running = 2,
    Idle = 3,
    Stopping = 4,
    Terminated = 5,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Running,
            3 => Self::Idle,
            4 => Self::Stopping,
            _ => Self::Terminated,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The three bus endpoints a client talks to.
#[derive(Clone, Debug)]
pub struct EndpointSet {
    /// Vehicle-orders stream (candidates in).
    pub e1: String,
    /// Order update / retry.
    pub e2: String,
    /// Finalization task channel.
    pub e3: String,
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self {
            e1: "inproc://vehicle-orders".into(),
            e2: "inproc://order-update".into(),
            e3: "inproc://order-finalize".into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VehicleClientConfig {
    pub endpoints: EndpointSet,
    /// Distributed claim-lock TTL.
    pub lock_ttl_ms: u64,
    /// Per-vehicle candidate hash TTL.
    pub cache_ttl: Duration,
}

impl Default for VehicleClientConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSet::default(),
            lock_ttl_ms: 1000,
            cache_ttl: Duration::from_secs(1800),
        }
    }
}

/// Counter snapshot for status surfaces and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct VehicleStats {
    pub claims_won: u64,
    pub claims_lost: u64,
    pub finalized: u64,
    pub compensated: u64,
}

#[derive(Debug)]
enum GrabOutcome {
    Won,
    /// CAS observed a different version: somebody else claimed first.
    Lost,
    /// Order missing or no longer pending; evicted from the cache.
    Gone,
    /// Distributed lock contended; entry stays for the next pass.
    LockBusy,
}

// ---------------------------------------------------------------------------
// VehicleClient
// ---------------------------------------------------------------------------

pub struct VehicleClient {
    uv_id: i64,
    store: Arc<dyn DispatchStore>,
    kv: Arc<dyn Kv>,
    cache: OrderCache,
    router: BusRouter,
    registry: VehicleRegistry,
    cfg: VehicleClientConfig,
    supported_types: Mutex<String>,
    state: AtomicU8,
    wake: Notify,
    claim_handle: Mutex<Option<JoinHandle<()>>>,
    claims_won: AtomicU64,
    claims_lost: AtomicU64,
    finalized: AtomicU64,
    compensated: AtomicU64,
}

impl VehicleClient {
    pub fn new(
        uv_id: i64,
        store: Arc<dyn DispatchStore>,
        kv: Arc<dyn Kv>,
        router: BusRouter,
        registry: VehicleRegistry,
        cfg: VehicleClientConfig,
    ) -> Arc<Self> {
        let cache = OrderCache::new(Arc::clone(&kv), cfg.cache_ttl);
        Arc::new(Self {
            uv_id,
            store,
            kv,
            cache,
            router,
            registry,
            cfg,
            supported_types: Mutex::new(String::new()),
            state: AtomicU8::new(ClientState::Created as u8),
            wake: Notify::new(),
            claim_handle: Mutex::new(None),
            claims_won: AtomicU64::new(0),
            claims_lost: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
            compensated: AtomicU64::new(0),
        })
    }

    pub fn uv_id(&self) -> i64 {
        self.uv_id
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> VehicleStats {
        VehicleStats {
            claims_won: self.claims_won.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            finalized: self.finalized.load(Ordering::Relaxed),
            compensated: self.compensated.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, next: ClientState) {
        self.state.store(next as u8, Ordering::SeqCst);
    }

    fn accepting(&self) -> bool {
        matches!(self.state(), ClientState::Running | ClientState::Idle)
    }

    fn stopping(&self) -> bool {
        matches!(self.state(), ClientState::Stopping | ClientState::Terminated)
    }

    /// Resolve capabilities, register the four subscriptions and start the
    /// claim loop. Callable once, from `Created`.
    pub async fn start(self: &Arc<Self>) -> Result<(), VehicleError> {
        if self
            .state
            .compare_exchange(
                ClientState::Created as u8,
                ClientState::Started as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(VehicleError::BadState);
        }

        let vehicle = self
            .store
            .vehicle_by_id(self.uv_id)
            .await?
            .ok_or(VehicleError::UnknownVehicle(self.uv_id))?;
        let codes = vehicle.supported_types.unwrap_or_default();
        if codes.is_empty() {
            warn!(uv_id = self.uv_id, "vehicle advertises no supported types; it will match nothing");
        }
        *self.supported_types.lock().expect("supported_types poisoned") = codes.clone();

        self.registry.register(self.uv_id, self);

        // E3: finalization task channel (DIRECT). Every client receives it;
        // on_finalize_task filters on the payload's uv_id.
        let task_sub = self.router.subscriber(&self.cfg.endpoints.e3);
        let weak = Arc::downgrade(self);
        task_sub.subscribe(
            vec![ORDER_LOG_TASK_TOPIC.to_string()],
            handler_fn(move |delivery| {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.on_finalize_task(delivery).await;
                    }
                }
            }),
            ExchangeType::Direct,
        );

        // E2: retried candidates and claim notifications.
        let update_sub = self.router.subscriber(&self.cfg.endpoints.e2);
        let weak = Arc::downgrade(self);
        update_sub.subscribe_headers(
            filter(&codes, RETRY_CHANNEL),
            handler_fn(move |delivery| {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.on_candidate(delivery).await;
                    }
                }
            }),
            Some(ORDER_RETRY_TOPIC.to_string()),
        );
        let weak = Arc::downgrade(self);
        update_sub.subscribe_headers(
            filter(&codes, UPDATE_CHANNEL),
            handler_fn(move |delivery| {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.on_order_update(delivery).await;
                    }
                }
            }),
            Some(ORDER_UPDATE_TOPIC.to_string()),
        );

        // E1: the main candidate stream.
        let order_sub = self.router.subscriber(&self.cfg.endpoints.e1);
        let weak = Arc::downgrade(self);
        order_sub.subscribe_headers(
            filter(&codes, VEHICLE_ORDERS_CHANNEL),
            handler_fn(move |delivery| {
                let weak = weak.clone();
                async move {
                    if let Some(client) = weak.upgrade() {
                        client.on_candidate(delivery).await;
                    }
                }
            }),
            Some(VEHICLE_ORDERS_TOPIC.to_string()),
        );

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.claim_loop().await;
        });
        *self.claim_handle.lock().expect("claim handle poisoned") = Some(handle);

        self.set_state(ClientState::Running);
        info!(uv_id = self.uv_id, supported_types = %codes, "vehicle client running");
        Ok(())
    }

    /// Signal the claim loop, join it (bounded), drop the candidate cache
    /// and deregister.
    pub async fn stop(&self) {
        if self.stopping() {
            return;
        }
        self.set_state(ClientState::Stopping);
        self.wake.notify_waiters();

        let handle = self
            .claim_handle
            .lock()
            .expect("claim handle poisoned")
            .take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!(uv_id = self.uv_id, "claim loop did not stop in time, detaching");
            }
        }

        if let Err(err) = self.cache.clear(self.uv_id).await {
            warn!(uv_id = self.uv_id, %err, "cache cleanup failed at stop");
        }
        self.registry.deregister(self.uv_id);
        self.set_state(ClientState::Terminated);
        info!(uv_id = self.uv_id, "vehicle client terminated");
    }

    // -- handlers --------------------------------------------------------

    /// Candidate arrival (vehicle_orders and order_retry): cache each
    /// order keyed by id and wake the claim loop.
    async fn on_candidate(&self, delivery: Delivery) {
        if !self.accepting() {
            return;
        }
        match decode_candidates(&delivery.body_str()) {
            Ok(entries) => {
                for (order_id, value) in entries {
                    let payload = value.to_string();
                    if let Err(err) = self.cache.cache_order(self.uv_id, &order_id, &payload).await
                    {
                        warn!(uv_id = self.uv_id, order_id = %order_id, %err, "candidate cache write failed");
                    }
                }
                self.wake.notify_one();
            }
            Err(err) => {
                warn!(uv_id = self.uv_id, topic = %delivery.topic, %err, "bad candidate payload dropped");
            }
        }
    }

    /// A claim happened somewhere: evict the order once its row confirms
    /// `status = 1`. Other statuses require no action at this layer.
    async fn on_order_update(&self, delivery: Delivery) {
        if !self.accepting() {
            return;
        }
        let body = delivery.body_str();
        let Ok(order_id) = body.trim().parse::<i64>() else {
            warn!(uv_id = self.uv_id, body = %body, "unparsable order-update body");
            return;
        };

        match self.store.order_by_id(order_id).await {
            Ok(Some(order)) if order.status == Some(1) => {
                if let Err(err) = self
                    .cache
                    .remove_order(self.uv_id, &order_id.to_string())
                    .await
                {
                    warn!(uv_id = self.uv_id, order_id, %err, "cache eviction failed");
                } else {
                    debug!(uv_id = self.uv_id, order_id, "claimed order evicted from cache");
                }
            }
            Ok(Some(order)) => {
                debug!(uv_id = self.uv_id, order_id, status = ?order.status, "order update acknowledged");
            }
            Ok(None) => {
                debug!(uv_id = self.uv_id, order_id, "order update for unknown order");
            }
            Err(err) => {
                warn!(uv_id = self.uv_id, order_id, %err, "order update lookup failed");
            }
        }
    }

    /// Finalization: persist grab-log + delivery-task for our own claims,
    /// compensating on partial failure.
    async fn on_finalize_task(&self, delivery: Delivery) {
        if !self.accepting() {
            return;
        }
        let payload = match FinalizePayload::decode(&delivery.body_str()) {
            Ok(p) => p,
            Err(err) => {
                warn!(uv_id = self.uv_id, %err, "bad finalization payload dropped");
                return;
            }
        };
        // Single-writer: everyone receives the DIRECT message, only the
        // claiming vehicle persists.
        if payload.uv_id != self.uv_id {
            return;
        }
        self.finalize(payload).await;
    }

    async fn finalize(&self, payload: FinalizePayload) {
        let Ok(order_id) = payload.order_id_num() else {
            warn!(uv_id = self.uv_id, order_id = %payload.order_id, "non-numeric order id in finalization");
            return;
        };
        let now = Utc::now();

        let mut log_id: Option<i64> = None;
        let mut task_id: Option<i64> = None;
        let mut failed = false;

        let log = GrabLog {
            order_id: Some(order_id),
            uv_id: Some(self.uv_id),
            status: Some(1),
            result: Some(1),
            bid_amount: Some(payload.order_reward),
            response_time: Some(payload.response_time_ms as i32),
            created_at: Some(now),
            updated_at: Some(now),
            is_delete: Some(0),
            ..GrabLog::default()
        };
        match self.store.insert_grab_log(&log).await {
            Ok(id) => log_id = Some(id),
            Err(err) => {
                error!(uv_id = self.uv_id, order_id, %err, "grab log insert failed");
                failed = true;
            }
        }

        let task = DeliveryTask {
            order_id: Some(order_id),
            uv_id: Some(self.uv_id),
            status: Some(1),
            start_time: Some(now),
            created_at: Some(now),
            updated_at: Some(now),
            is_delete: Some(0),
            ..DeliveryTask::default()
        };
        match self.store.insert_delivery_task(&task).await {
            Ok(id) => task_id = Some(id),
            Err(err) => {
                error!(uv_id = self.uv_id, order_id, %err, "delivery task insert failed");
                failed = true;
            }
        }

        if failed {
            self.compensate(order_id, payload.order_type_code, log_id, task_id)
                .await;
        } else {
            self.finalized.fetch_add(1, Ordering::Relaxed);
            debug!(uv_id = self.uv_id, order_id, ?log_id, ?task_id, "finalization complete");
        }
    }

    /// Undo a half-finalized claim and return the order to circulation.
    async fn compensate(
        &self,
        order_id: i64,
        order_type_code: i64,
        log_id: Option<i64>,
        task_id: Option<i64>,
    ) {
        warn!(uv_id = self.uv_id, order_id, "compensating failed finalization");

        if let Err(err) = self.store.rollback_claim(order_id).await {
            error!(order_id, %err, "claim rollback failed");
        }
        if let Some(id) = log_id {
            if let Err(err) = self.store.remove_grab_log(id).await {
                warn!(order_id, log_id = id, %err, "grab log cleanup failed");
            }
        }
        if let Some(id) = task_id {
            if let Err(err) = self.store.remove_delivery_task(id).await {
                warn!(order_id, task_id = id, %err, "delivery task cleanup failed");
            }
        }

        let publisher = self.router.publisher(&self.cfg.endpoints.e2);
        let mut headers = BTreeMap::new();
        headers.insert("type".to_string(), order_type_code.to_string());
        headers.insert("channel".to_string(), RETRY_CHANNEL.to_string());
        if let Err(err) = publisher.publish(Message::headers(
            ORDER_RETRY_TOPIC,
            order_id.to_string().into_bytes(),
            headers,
        )) {
            error!(order_id, %err, "retry publish failed; order stays pending for the next sweep");
        }
        self.compensated.fetch_add(1, Ordering::Relaxed);
    }

    // -- claim loop ------------------------------------------------------

    async fn claim_loop(self: Arc<Self>) {
        info!(uv_id = self.uv_id, "claim loop started");
        let mut idle_cycles: u32 = 0;

        loop {
            if self.stopping() {
                break;
            }

            let orders = match self.cache.orders(self.uv_id).await {
                Ok(o) => o,
                Err(err) => {
                    warn!(uv_id = self.uv_id, %err, "candidate read failed");
                    tokio::time::sleep(SHORT_SLEEP).await;
                    continue;
                }
            };

            if orders.is_empty() {
                idle_cycles += 1;
                if idle_cycles >= MAX_IDLE_CYCLES {
                    // Deep sleep, woken early by candidate arrival or stop.
                    self.set_state(ClientState::Idle);
                    let _ = tokio::time::timeout(DEEP_SLEEP, self.wake.notified()).await;
                    if !self.stopping() {
                        self.set_state(ClientState::Running);
                    }
                    idle_cycles = 0;
                } else {
                    tokio::time::sleep(SHORT_SLEEP).await;
                }
                continue;
            }

            idle_cycles = 0;
            for (order_id, _payload) in orders {
                if self.stopping() {
                    break;
                }
                match self.grab_order(&order_id).await {
                    Ok(GrabOutcome::Won) => {
                        self.claims_won.fetch_add(1, Ordering::Relaxed);
                        info!(uv_id = self.uv_id, order_id = %order_id, "claim won");
                    }
                    Ok(GrabOutcome::Lost) => {
                        self.claims_lost.fetch_add(1, Ordering::Relaxed);
                        debug!(uv_id = self.uv_id, order_id = %order_id, "claim lost");
                    }
                    Ok(GrabOutcome::Gone | GrabOutcome::LockBusy) => {}
                    Err(err) => {
                        warn!(uv_id = self.uv_id, order_id = %order_id, %err, "claim attempt failed");
                        let _ = self.cache.remove_order(self.uv_id, &order_id).await;
                    }
                }
            }
        }
        info!(uv_id = self.uv_id, "claim loop stopped");
    }

    async fn grab_order(&self, order_key: &str) -> Result<GrabOutcome, VehicleError> {
        let order_id: i64 = order_key.parse().map_err(|_| {
            VehicleError::Payload(uvd_schemas::PayloadError::Shape(format!(
                "non-numeric cached order id {order_key}"
            )))
        })?;

        let lock = DistLock::new(
            Arc::clone(&self.kv),
            format!("order_lock:{order_id}"),
            self.cfg.lock_ttl_ms,
        );
        match lock.acquire().await {
            Ok(()) => {}
            Err(KvError::LockContended(_)) => {
                // Another actor is racing this order; the entry stays and
                // is evicted by the next update event.
                return Ok(GrabOutcome::LockBusy);
            }
            Err(err) => return Err(err.into()),
        }

        let outcome = self.grab_locked(order_id, order_key).await;
        if let Err(err) = lock.unlock().await {
            warn!(order_id, %err, "claim lock release failed; TTL will reap it");
        }
        outcome
    }

    async fn grab_locked(
        &self,
        order_id: i64,
        order_key: &str,
    ) -> Result<GrabOutcome, VehicleError> {
        let Some(order) = self.store.order_by_id(order_id).await? else {
            self.cache.remove_order(self.uv_id, order_key).await?;
            return Ok(GrabOutcome::Gone);
        };
        if order.status != Some(0) {
            self.cache.remove_order(self.uv_id, order_key).await?;
            return Ok(GrabOutcome::Gone);
        }

        let t_start = Utc::now();
        let clock = std::time::Instant::now();
        let version = order.version.unwrap_or(0);

        match self
            .store
            .claim_order(order_id, self.uv_id, version, t_start)
            .await
        {
            Ok(()) => {}
            Err(StoreError::ClaimLost(_)) => return Ok(GrabOutcome::Lost),
            Err(err) => return Err(err.into()),
        }
        let response_time_ms = clock.elapsed().as_millis() as i64;

        self.cache.remove_order(self.uv_id, order_key).await?;

        // Tell every matching vehicle to evict the claimed order.
        let code = order.order_type_code.unwrap_or(0);
        let update_pub = self.router.publisher(&self.cfg.endpoints.e2);
        let mut headers = BTreeMap::new();
        headers.insert("type".to_string(), code.to_string());
        headers.insert("channel".to_string(), UPDATE_CHANNEL.to_string());
        update_pub.publish(Message::headers(
            ORDER_UPDATE_TOPIC,
            order_id.to_string().into_bytes(),
            headers,
        ))?;

        // Drive finalization.
        let payload = FinalizePayload {
            order_id: order_id.to_string(),
            uv_id: self.uv_id,
            response_time_ms,
            order_type_code: code,
            order_reward: order.reward.unwrap_or(0.0),
        };
        let task_pub = self.router.publisher(&self.cfg.endpoints.e3);
        task_pub.publish(Message::direct(
            ORDER_LOG_TASK_TOPIC,
            payload.encode()?.into_bytes(),
        ))?;

        Ok(GrabOutcome::Won)
    }
}

/// The HEADERS filter for one channel: `type` carries the comma-joined
/// supported codes (comma-list semantics match any element).
fn filter(codes: &str, channel: &str) -> BTreeMap<String, String> {
    let mut f = BTreeMap::new();
    f.insert("type".to_string(), codes.to_string());
    f.insert("channel".to_string(), channel.to_string());
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips() {
        for state in [
            ClientState::Created,
            ClientState::Started,
            ClientState::Running,
            ClientState::Idle,
            ClientState::Stopping,
            ClientState::Terminated,
        ] {
            assert_eq!(ClientState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn filter_carries_codes_and_channel() {
        let f = filter("101,701", "vehicle_orders");
        assert_eq!(f["type"], "101,701");
        assert_eq!(f["channel"], "vehicle_orders");
    }
}
