//! Endpoint registry: idempotent acquisition of publisher / subscriber
//! instances, one shared instance per endpoint per process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::publisher::Frames;
use crate::{BusConfig, Publisher, Subscriber};

struct Registry {
    links: HashMap<String, broadcast::Sender<Frames>>,
    publishers: HashMap<String, Arc<Publisher>>,
    subscribers: HashMap<String, Arc<Subscriber>>,
}

/// Process-scoped endpoint registry.
///
/// Constructed once at startup and passed explicitly (cheaply cloneable).
/// `publisher` / `subscriber` are idempotent: the first call for an
/// endpoint creates and starts the instance, later calls return it.
#[derive(Clone)]
pub struct BusRouter {
    cfg: BusConfig,
    registry: Arc<Mutex<Registry>>,
}

impl BusRouter {
    pub fn new(cfg: BusConfig) -> Self {
        Self {
            cfg,
            registry: Arc::new(Mutex::new(Registry {
                links: HashMap::new(),
                publishers: HashMap::new(),
                subscribers: HashMap::new(),
            })),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.cfg
    }

    /// Acquire the publisher bound to `endpoint`, creating and binding it
    /// on first use.
    pub fn publisher(&self, endpoint: &str) -> Arc<Publisher> {
        let mut reg = self.registry.lock().expect("bus registry poisoned");
        if let Some(existing) = reg.publishers.get(endpoint) {
            return Arc::clone(existing);
        }
        let tx = Self::link(&self.cfg, &mut reg.links, endpoint);
        let publisher = Arc::new(Publisher::new(endpoint, self.cfg.clone()));
        publisher.bind(tx);
        reg.publishers.insert(endpoint.to_string(), Arc::clone(&publisher));
        publisher
    }

    /// Acquire the subscriber connected to `endpoint`, creating and
    /// starting it on first use. Subscriptions are additive on the shared
    /// instance.
    pub fn subscriber(&self, endpoint: &str) -> Arc<Subscriber> {
        let mut reg = self.registry.lock().expect("bus registry poisoned");
        if let Some(existing) = reg.subscribers.get(endpoint) {
            return Arc::clone(existing);
        }
        let rx = Self::link(&self.cfg, &mut reg.links, endpoint).subscribe();
        let subscriber = Arc::new(Subscriber::new(endpoint));
        subscriber.connect(rx);
        reg.subscribers.insert(endpoint.to_string(), Arc::clone(&subscriber));
        subscriber
    }

    /// An extra transport receiver for `endpoint`, for observers that need
    /// their own receive cursor (the dead-letter tap).
    pub fn observe(&self, endpoint: &str) -> broadcast::Receiver<Frames> {
        let mut reg = self.registry.lock().expect("bus registry poisoned");
        Self::link(&self.cfg, &mut reg.links, endpoint).subscribe()
    }

    /// Stop every publisher and subscriber of this router.
    pub fn shutdown(&self) {
        let reg = self.registry.lock().expect("bus registry poisoned");
        for publisher in reg.publishers.values() {
            publisher.stop();
        }
        for subscriber in reg.subscribers.values() {
            subscriber.stop();
        }
    }

    fn link(
        cfg: &BusConfig,
        links: &mut HashMap<String, broadcast::Sender<Frames>>,
        endpoint: &str,
    ) -> broadcast::Sender<Frames> {
        links
            .entry(endpoint.to_string())
            .or_insert_with(|| broadcast::channel(cfg.hwm.max(1)).0)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquisition_is_idempotent() {
        let router = BusRouter::new(BusConfig::default());
        let p1 = router.publisher("inproc://idem");
        let p2 = router.publisher("inproc://idem");
        assert!(Arc::ptr_eq(&p1, &p2));

        let s1 = router.subscriber("inproc://idem");
        let s2 = router.subscriber("inproc://idem");
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn endpoints_are_isolated() {
        let router = BusRouter::new(BusConfig::default());
        let a = router.publisher("inproc://a");
        let b = router.publisher("inproc://b");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
