//! One-call wiring of the in-process pipeline.
//!
//! Store, KV, bus router, dispatcher and any number of vehicle clients,
//! all on endpoints namespaced by a test tag so parallel tests never share
//! a channel.

use std::sync::{Arc, Mutex};

use uvd_bus::{BusConfig, BusRouter};
use uvd_dispatch::OrderDispatcher;
use uvd_kv::{Kv, MemoryKv};
use uvd_vehicle::{EndpointSet, VehicleClient, VehicleClientConfig, VehicleError, VehicleRegistry};

use crate::MemoryStore;

pub struct Orchestrator {
    pub store: Arc<MemoryStore>,
    pub kv: Arc<MemoryKv>,
    pub router: BusRouter,
    pub registry: VehicleRegistry,
    pub endpoints: EndpointSet,
    pub dispatcher: OrderDispatcher,
    clients: Mutex<Vec<Arc<VehicleClient>>>,
}

impl Orchestrator {
    /// Build a pipeline whose endpoints are namespaced by `tag`.
    pub fn new(tag: &str) -> Self {
        Self::with_bus_config(tag, BusConfig::default())
    }

    pub fn with_bus_config(tag: &str, bus_cfg: BusConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new());
        let router = BusRouter::new(bus_cfg);
        let registry = VehicleRegistry::new();
        let endpoints = EndpointSet {
            e1: format!("inproc://{tag}-vehicle-orders"),
            e2: format!("inproc://{tag}-order-update"),
            e3: format!("inproc://{tag}-order-finalize"),
        };

        let dispatcher = OrderDispatcher::new(
            Arc::clone(&store) as Arc<dyn uvd_db::DispatchStore>,
            Arc::clone(&kv) as Arc<dyn Kv>,
            router.publisher(&endpoints.e1),
            None,
            100,
        );

        Self {
            store,
            kv,
            router,
            registry,
            endpoints,
            dispatcher,
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Start a client for an already-seeded vehicle row.
    pub async fn start_vehicle(&self, uv_id: i64) -> Result<Arc<VehicleClient>, VehicleError> {
        let client = VehicleClient::new(
            uv_id,
            Arc::clone(&self.store) as Arc<dyn uvd_db::DispatchStore>,
            Arc::clone(&self.kv) as Arc<dyn Kv>,
            self.router.clone(),
            self.registry.clone(),
            VehicleClientConfig {
                endpoints: self.endpoints.clone(),
                ..VehicleClientConfig::default()
            },
        );
        client.start().await?;
        self.clients.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }

    pub async fn shutdown(&self) {
        let clients: Vec<_> = self.clients.lock().unwrap().drain(..).collect();
        for client in clients {
            client.stop().await;
        }
        self.router.shutdown();
    }
}
