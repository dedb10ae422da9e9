//! Subscriber side: per-endpoint receive loop with subscriber-side filtering.
//!
//! All filtering happens here, on the receiving end — the transport carries
//! every frame to every connected subscriber, exactly like a SUB socket
//! subscribed to everything. Handlers run inline on the loop (that is what
//! preserves per-pair ordering); a handler with heavy work posts it to its
//! own worker instead of blocking here.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::publisher::Frames;
use crate::wire::{decode_frames, headers_match, DecodedFrames};
use crate::ExchangeType;

/// One delivered message, after frame decoding.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub exchange: ExchangeType,
    pub topic: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Callback invoked for each matching delivery.
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |delivery| Box::pin(f(delivery)))
}

enum SubKind {
    /// DIRECT (exact topic), TOPIC (prefix on the composite first frame) or
    /// FANOUT (everything of that shape).
    Topics {
        exchange: ExchangeType,
        topics: Vec<String>,
    },
    /// HEADERS filter map plus optional exact topic.
    Headers {
        filter: BTreeMap<String, String>,
        topic: Option<String>,
    },
    /// Every frame, regardless of shape or filters (dead-letter tap).
    Raw,
}

struct Subscription {
    kind: SubKind,
    handler: Handler,
}

/// A connected subscriber for one endpoint. Subscriptions are additive and
/// may be registered before or after [`connect`][Subscriber::connect].
pub struct Subscriber {
    endpoint: String,
    subs: Mutex<Vec<Subscription>>,
    running: AtomicBool,
    lagged: AtomicU64,
    received: AtomicU64,
}

impl Subscriber {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            subs: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            lagged: AtomicU64::new(0),
            received: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register topics under DIRECT / TOPIC / FANOUT semantics.
    pub fn subscribe(&self, topics: Vec<String>, handler: Handler, exchange: ExchangeType) {
        self.subs
            .lock()
            .expect("subscriptions poisoned")
            .push(Subscription {
                kind: SubKind::Topics { exchange, topics },
                handler,
            });
    }

    /// Register a HEADERS filter with an optional exact topic.
    pub fn subscribe_headers(
        &self,
        filter: BTreeMap<String, String>,
        handler: Handler,
        topic: Option<String>,
    ) {
        self.subs
            .lock()
            .expect("subscriptions poisoned")
            .push(Subscription {
                kind: SubKind::Headers { filter, topic },
                handler,
            });
    }

    /// Register a tap that sees every frame on the endpoint.
    pub fn subscribe_raw(&self, handler: Handler) {
        self.subs
            .lock()
            .expect("subscriptions poisoned")
            .push(Subscription {
                kind: SubKind::Raw,
                handler,
            });
    }

    /// Number of frames this subscriber's transport dropped due to lag.
    pub fn lagged(&self) -> u64 {
        self.lagged.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Attach the transport and start the receive loop. Idempotent.
    pub fn connect(self: &Arc<Self>, rx: broadcast::Receiver<Frames>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.recv_loop(rx).await;
        });
    }

    /// Stop the receive loop; in-flight frames already queued on the
    /// transport are drained before it exits.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn recv_loop(self: Arc<Self>, mut rx: broadcast::Receiver<Frames>) {
        debug!(endpoint = %self.endpoint, "subscriber loop started");
        loop {
            if !self.running.load(Ordering::SeqCst) {
                // Drain whatever already arrived, then return.
                while let Ok(frames) = rx.try_recv() {
                    self.dispatch(&frames).await;
                }
                break;
            }
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Ok(frames)) => self.dispatch(&frames).await,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    self.lagged.fetch_add(n, Ordering::Relaxed);
                    warn!(endpoint = %self.endpoint, dropped = n, "subscriber lagged, frames dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    warn!(endpoint = %self.endpoint, "endpoint closed");
                    break;
                }
                Err(_elapsed) => continue,
            }
        }
        debug!(endpoint = %self.endpoint, "subscriber loop stopped");
    }

    /// Handlers run inline on the receive loop, in subscription order —
    /// this is what preserves per-(publisher, subscriber) delivery order.
    /// A handler that has heavy work to do must hand it to its own worker
    /// rather than block here.
    async fn dispatch(&self, frames: &[Vec<u8>]) {
        let decoded = match decode_frames(frames) {
            Ok(d) => d,
            Err(err) => {
                warn!(endpoint = %self.endpoint, %err, "undecodable frame dropped");
                return;
            }
        };
        self.received.fetch_add(1, Ordering::Relaxed);

        // Collect matching handlers under the lock, run them outside it.
        let matched: Vec<Handler> = {
            let subs = self.subs.lock().expect("subscriptions poisoned");
            subs.iter()
                .filter(|s| matches(&s.kind, &decoded))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in matched {
            let delivery = Delivery {
                exchange: decoded.exchange,
                topic: decoded.topic.clone(),
                headers: decoded.headers.clone(),
                body: decoded.body.clone(),
            };
            handler(delivery).await;
        }
    }
}

fn matches(kind: &SubKind, msg: &DecodedFrames) -> bool {
    match kind {
        SubKind::Raw => true,
        SubKind::Topics { exchange, topics } => {
            if *exchange != msg.exchange {
                return false;
            }
            match exchange {
                // Verbatim topic match.
                ExchangeType::Direct => topics.iter().any(|t| t == &msg.topic),
                // Prefix match on the composite `routing_key:topic` frame.
                ExchangeType::Topic => topics.iter().any(|t| msg.topic.starts_with(t.as_str())),
                // Every subscriber receives every message.
                ExchangeType::Fanout => true,
                ExchangeType::Headers => false,
            }
        }
        SubKind::Headers { filter, topic } => {
            msg.exchange == ExchangeType::Headers
                && headers_match(filter, topic.as_deref(), &msg.topic, &msg.headers)
        }
    }
}
