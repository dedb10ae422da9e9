//! Broker-less multicast fabric with four exchange disciplines.
//!
//! A [`BusRouter`] owns a set of named endpoints. A publisher binds an
//! endpoint and drains a bounded in-memory queue onto it in batches; any
//! number of subscribers connect and filter the frame stream on their own
//! side (DIRECT / TOPIC / FANOUT / HEADERS), exactly like a PUB/SUB socket
//! pair. There is no persistence inside the bus: overflow and send timeouts
//! drop messages (logged), durability is the dead-letter subsystem's job.
//!
//! Ordering: within one (publisher, subscriber) pair, messages arrive in
//! publish order. Across publishers there is no guarantee.

mod publisher;
mod router;
mod subscriber;
pub mod wire;

pub use publisher::Publisher;
pub use router::BusRouter;
pub use subscriber::{handler_fn, Delivery, Handler, Subscriber};
pub use wire::{ExchangeType, FrameHeader, Message, FRAME_HEADER_LEN};

use thiserror::Error;

/// Tuning knobs shared by every endpoint of a router.
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Per-publisher queue bound; [`publish`][Publisher::publish] fails with
    /// [`BusError::Overflow`] at this size.
    pub max_queue_size: usize,
    /// Per-message deadline in the drain loop; timed-out messages are
    /// dropped with a warning.
    pub send_timeout_ms: u64,
    /// How many messages one drain pass takes off the queue.
    pub batch_size: usize,
    /// In-flight bound of the underlying transport (lagging subscribers
    /// lose the oldest frames, as with a socket HWM).
    pub hwm: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            send_timeout_ms: 200,
            batch_size: 50,
            hwm: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    /// The bounded publish queue is full; retry after a drain.
    #[error("publish queue overflow (bound {0})")]
    Overflow(usize),
    /// A message missed its send deadline and was dropped.
    #[error("send timed out after {0} ms")]
    SendTimeout(u64),
    /// The endpoint vanished mid-send and rebinding failed.
    #[error("endpoint gone: {0}")]
    EndpointGone(String),
    /// The router (or this instance) has been shut down.
    #[error("bus closed")]
    Closed,
    /// A received frame sequence does not match any known layout.
    #[error("bad frame: {0}")]
    BadFrame(String),
}
