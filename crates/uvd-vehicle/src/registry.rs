//! Process-wide vehicle-id → client lookup.
//!
//! Holds weak references only: a handler upgrades for the duration of one
//! call, so the registry never keeps a stopped client alive and the
//! client ↔ registry cycle is broken by construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::client::VehicleClient;

#[derive(Clone, Default)]
pub struct VehicleRegistry {
    inner: Arc<Mutex<HashMap<i64, Weak<VehicleClient>>>>,
}

impl VehicleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uv_id: i64, client: &Arc<VehicleClient>) {
        self.inner
            .lock()
            .expect("vehicle registry poisoned")
            .insert(uv_id, Arc::downgrade(client));
    }

    pub fn deregister(&self, uv_id: i64) {
        self.inner
            .lock()
            .expect("vehicle registry poisoned")
            .remove(&uv_id);
    }

    /// Strong reference for the duration of a handler call, or `None` when
    /// the client is gone.
    pub fn get(&self, uv_id: i64) -> Option<Arc<VehicleClient>> {
        self.inner
            .lock()
            .expect("vehicle registry poisoned")
            .get(&uv_id)
            .and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("vehicle registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
