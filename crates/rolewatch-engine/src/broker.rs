//! Broker interface
//!
//! Topic-routed, at-least-once delivery. A message stays unacknowledged
//! until the worker acks it after the merge; a nack (or a lost consumer)
//! puts it back on the queue flagged as redelivered.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use rolewatch_common::{RolewatchError, RolewatchResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// One delivered message
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery tag used to ack or nack
    pub tag: u64,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message body
    pub payload: Bytes,
    /// Delivered before and not acknowledged
    pub redelivered: bool,
}

/// At-least-once message source
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Wait up to `poll` for the next message
    async fn receive(&self, poll: Duration) -> RolewatchResult<Option<Delivery>>;

    /// Acknowledge a processed message
    async fn ack(&self, tag: u64) -> RolewatchResult<()>;

    /// Reject a message, optionally returning it to the queue
    async fn nack(&self, tag: u64, requeue: bool) -> RolewatchResult<()>;
}

/// In-process broker
pub struct InMemoryBroker {
    queue: Mutex<VecDeque<Delivery>>,
    unacked: DashMap<u64, Delivery>,
    notify: Notify,
    next_tag: AtomicU64,
}

impl InMemoryBroker {
    /// Create empty broker
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            unacked: DashMap::new(),
            notify: Notify::new(),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Publish a message
    pub fn publish(&self, routing_key: &str, payload: impl Into<Bytes>) {
        let delivery = Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            redelivered: false,
        };
        self.queue.lock().push_back(delivery);
        self.notify.notify_one();
    }

    /// Requeue every unacknowledged message, as after a consumer crash
    pub fn redeliver_unacked(&self) -> usize {
        let tags: Vec<u64> = self.unacked.iter().map(|e| *e.key()).collect();
        let mut count = 0;
        for tag in tags {
            if let Some((_, delivery)) = self.unacked.remove(&tag) {
                self.requeue(delivery);
                count += 1;
            }
        }
        count
    }

    /// Messages waiting for a consumer
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Messages delivered and not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    /// Nothing queued and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.queued() == 0 && self.unacked() == 0
    }

    fn requeue(&self, mut delivery: Delivery) {
        delivery.redelivered = true;
        self.queue.lock().push_back(delivery);
        self.notify.notify_one();
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn receive(&self, poll: Duration) -> RolewatchResult<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + poll;
        loop {
            {
                // Hand-off under the queue lock so is_idle never sees the gap
                let mut queue = self.queue.lock();
                if let Some(delivery) = queue.pop_front() {
                    self.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(Some(delivery));
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified()).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, tag: u64) -> RolewatchResult<()> {
        self.unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or_else(|| RolewatchError::Broker(format!("unknown delivery tag {}", tag)))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> RolewatchResult<()> {
        let (_, delivery) = self
            .unacked
            .remove(&tag)
            .ok_or_else(|| RolewatchError::Broker(format!("unknown delivery tag {}", tag)))?;
        if requeue {
            self.requeue(delivery);
        }
        Ok(())
    }
}
