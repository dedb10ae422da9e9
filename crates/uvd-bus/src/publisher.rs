//! Publisher side: bounded queue + batched drain worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::{debug, warn};

use crate::wire::encode_frames;
use crate::{BusConfig, BusError, Message};

pub(crate) type Frames = Arc<Vec<Vec<u8>>>;

/// Counters exposed for status reporting.
#[derive(Clone, Copy, Debug, Default)]
pub struct PublisherStats {
    pub published: u64,
    pub dropped: u64,
    pub timeouts: u64,
}

/// A bound publisher for one endpoint.
///
/// `publish` only enqueues; a drain worker started by
/// [`bind`][Publisher::bind] moves messages onto the transport in batches.
/// Before `bind` the queue simply accumulates (up to the bound), which is
/// also how tests exercise the overflow contract without a transport.
pub struct Publisher {
    endpoint: String,
    cfg: BusConfig,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    running: AtomicBool,
    link: Mutex<Option<broadcast::Sender<Frames>>>,
    published: AtomicU64,
    dropped: AtomicU64,
    timeouts: AtomicU64,
}

impl Publisher {
    pub fn new(endpoint: impl Into<String>, cfg: BusConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            cfg,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            link: Mutex::new(None),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Enqueue one message. Fails with [`BusError::Overflow`] when the
    /// queue is at its bound; the caller is expected to retry on its next
    /// cycle (pending work stays wherever it is durable).
    pub fn publish(&self, msg: Message) -> Result<(), BusError> {
        {
            let mut queue = self.queue.lock().expect("publisher queue poisoned");
            if queue.len() >= self.cfg.max_queue_size {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(BusError::Overflow(self.cfg.max_queue_size));
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// N enqueues under a single critical section. Not an atomic broker
    /// batch: messages accepted before the bound is hit stay enqueued.
    pub fn publish_batch(&self, msgs: Vec<Message>) -> Result<(), BusError> {
        {
            let mut queue = self.queue.lock().expect("publisher queue poisoned");
            for msg in msgs {
                if queue.len() >= self.cfg.max_queue_size {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return Err(BusError::Overflow(self.cfg.max_queue_size));
                }
                queue.push_back(msg);
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("publisher queue poisoned").len()
    }

    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Attach the transport and start the drain worker. Idempotent: a
    /// second bind on a live publisher is ignored.
    pub fn bind(self: &Arc<Self>, tx: broadcast::Sender<Frames>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.link.lock().expect("publisher link poisoned") = Some(tx);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drain_loop().await;
        });
    }

    /// Signal the drain worker to flush what remains and exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn drain_loop(self: Arc<Self>) {
        debug!(endpoint = %self.endpoint, "publisher drain worker started");
        loop {
            let _ = tokio::time::timeout(Duration::from_millis(100), self.notify.notified()).await;

            let batch = {
                let mut queue = self.queue.lock().expect("publisher queue poisoned");
                let trimmed = trim_overflow(&mut queue, self.cfg.max_queue_size);
                if trimmed > 0 {
                    self.dropped.fetch_add(trimmed as u64, Ordering::Relaxed);
                    warn!(
                        endpoint = %self.endpoint,
                        trimmed,
                        "queue overflow, discarding oldest messages"
                    );
                }
                let count = queue.len().min(self.cfg.batch_size);
                queue.drain(..count).collect::<Vec<_>>()
            };

            if batch.is_empty() && !self.running.load(Ordering::SeqCst) {
                break;
            }

            for msg in batch {
                let topic = msg.topic.clone();
                let frames: Frames = Arc::new(encode_frames(&msg));
                let deadline = Duration::from_millis(self.cfg.send_timeout_ms);
                match tokio::time::timeout(deadline, self.send(frames)).await {
                    Ok(Ok(())) => {
                        self.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        // Transport error: drop the message. The link is
                        // re-read from the registry on the next send, which
                        // is the rebind.
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(endpoint = %self.endpoint, topic, %err, "send failed, message dropped");
                    }
                    Err(_) => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            endpoint = %self.endpoint,
                            topic,
                            timeout_ms = self.cfg.send_timeout_ms,
                            "send timed out, message dropped"
                        );
                    }
                }
            }
        }
        debug!(endpoint = %self.endpoint, "publisher drain worker stopped");
    }

    async fn send(&self, frames: Frames) -> Result<(), BusError> {
        let tx = {
            let link = self.link.lock().expect("publisher link poisoned");
            link.clone()
        };
        match tx {
            // A send error only means nobody is subscribed right now; a
            // PUB socket drops such messages silently, and so do we.
            Some(tx) => {
                let _ = tx.send(frames);
                Ok(())
            }
            None => Err(BusError::EndpointGone(self.endpoint.clone())),
        }
    }
}

/// Racing producers can push the queue past its bound between drain passes;
/// above 1.2x the bound the oldest entries are discarded down to the bound.
/// Returns the number discarded.
fn trim_overflow(queue: &mut VecDeque<Message>, max: usize) -> usize {
    let soft_limit = max + max / 5;
    if queue.len() <= soft_limit {
        return 0;
    }
    let excess = queue.len() - max;
    queue.drain(..excess);
    excess
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cfg(max: usize) -> BusConfig {
        BusConfig {
            max_queue_size: max,
            ..BusConfig::default()
        }
    }

    #[test]
    fn overflow_after_bound_then_resumes_after_drain() {
        let publisher = Publisher::new("inproc://overflow", small_cfg(10));

        for i in 0..10 {
            publisher
                .publish(Message::direct("t", format!("{i}").into_bytes()))
                .unwrap();
        }
        assert_eq!(publisher.queue_len(), 10);

        // The 11th and 12th publishes fail.
        for _ in 0..2 {
            let err = publisher
                .publish(Message::direct("t", b"x".to_vec()))
                .unwrap_err();
            assert!(matches!(err, BusError::Overflow(10)));
        }
        assert_eq!(publisher.stats().dropped, 2);

        // Simulate a drain, then publishing succeeds again.
        publisher.queue.lock().unwrap().clear();
        publisher.publish(Message::direct("t", b"y".to_vec())).unwrap();
    }

    #[test]
    fn batch_is_all_enqueued_under_one_section() {
        let publisher = Publisher::new("inproc://batch", small_cfg(100));
        let msgs = (0..20)
            .map(|i| Message::direct("t", format!("{i}").into_bytes()))
            .collect();
        publisher.publish_batch(msgs).unwrap();
        assert_eq!(publisher.queue_len(), 20);
    }

    #[test]
    fn batch_stops_at_bound() {
        let publisher = Publisher::new("inproc://batch-bound", small_cfg(5));
        let msgs = (0..8)
            .map(|i| Message::direct("t", format!("{i}").into_bytes()))
            .collect();
        let err = publisher.publish_batch(msgs).unwrap_err();
        assert!(matches!(err, BusError::Overflow(5)));
        assert_eq!(publisher.queue_len(), 5);
    }

    #[test]
    fn trim_only_kicks_in_past_soft_limit() {
        let mut queue: VecDeque<Message> = (0..11)
            .map(|i| Message::direct("t", format!("{i}").into_bytes()))
            .collect();
        // 11 <= 10 + 2: no trim.
        assert_eq!(trim_overflow(&mut queue, 10), 0);
        assert_eq!(queue.len(), 11);

        let mut queue: VecDeque<Message> = (0..15)
            .map(|i| Message::direct("t", format!("{i}").into_bytes()))
            .collect();
        // 15 > 12: trimmed down to the bound, oldest first.
        assert_eq!(trim_overflow(&mut queue, 10), 5);
        assert_eq!(queue.len(), 10);
        assert_eq!(queue.front().unwrap().body, b"5".to_vec());
    }
}
