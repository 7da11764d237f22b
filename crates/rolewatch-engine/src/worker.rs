//! Worker Pool
//!
//! Each worker repeatedly receives one message, extracts features and
//! classifies outside any lock, merges under the identity's shard lock, and
//! acknowledges only after the merge has completed. A crash before the ack
//! means redelivery, which the merge recognises as a duplicate. Retryable
//! failures wait out a bounded backoff before the message is requeued.

use crate::actions::OperatorAction;
use crate::broker::{Broker, Delivery};
use crate::config::RetryConfig;
use crate::emitter::EmitterHandle;
use crate::report::{ReportEvent, ReportingSink};
use crate::stats::EngineStats;
use arc_swap::ArcSwap;
use rolewatch_common::{Observation, RolewatchError, RolewatchResult};
use rolewatch_ml::{extract, StageChain};
use rolewatch_state::{DeviceStore, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Shared by every worker
pub struct WorkerContext {
    /// Message source
    pub broker: Arc<dyn Broker>,
    /// Current classifier chain
    pub chain: Arc<ArcSwap<StageChain>>,
    /// Device store
    pub store: Arc<DeviceStore>,
    /// Enforcement queue
    pub emitter: EmitterHandle,
    /// Report destination
    pub sink: Arc<dyn ReportingSink>,
    /// Counters
    pub stats: Arc<EngineStats>,
    /// Routing key of operator actions
    pub action_topic: String,
    /// Broker poll interval
    pub poll: Duration,
    /// Backoff before requeueing a retryable failure
    pub requeue: RetryConfig,
}

/// What to do with a message after processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    Requeue,
}

impl WorkerContext {
    /// Process one delivery and settle it with the broker
    pub async fn handle(&self, delivery: Delivery) {
        self.stats.record_received();

        let disposition = if delivery.routing_key == self.action_topic {
            self.handle_action(&delivery).await
        } else {
            self.handle_observation(&delivery).await
        };

        let settled = match disposition {
            Disposition::Ack => self.broker.ack(delivery.tag).await,
            Disposition::Requeue => {
                self.stats.record_nack();
                let delay = self.requeue_delay(&delivery);
                tracing::debug!(tag = delivery.tag, ?delay, "Requeue backoff");
                tokio::time::sleep(delay).await;
                self.broker.nack(delivery.tag, true).await
            }
        };
        if let Err(e) = settled {
            tracing::warn!(tag = delivery.tag, "Failed to settle delivery: {}", e);
        }
    }

    async fn handle_observation(&self, delivery: &Delivery) -> Disposition {
        match self.process(&delivery.payload) {
            Ok(transition) => {
                self.apply_side_effects(&transition).await;
                Disposition::Ack
            }
            Err(e) => self.disposition_for(e, delivery),
        }
    }

    async fn handle_action(&self, delivery: &Delivery) -> Disposition {
        match OperatorAction::from_slice(&delivery.payload).and_then(|a| a.apply(&self.store)) {
            Ok(result) => {
                self.stats.record_action();
                if let Some((identity, label)) = result.enforce {
                    if let Err(e) = self.emitter.submit(identity.clone(), label).await {
                        // Still pending in the store; the sweeper resubmits it
                        tracing::warn!(identity = %identity, "Enforcement not queued: {}", e);
                    }
                }
                Disposition::Ack
            }
            Err(e) => self.disposition_for(e, delivery),
        }
    }

    /// First failures wait `initial_ms`, redeliveries the next step up
    fn requeue_delay(&self, delivery: &Delivery) -> Duration {
        self.requeue.delay(if delivery.redelivered { 2 } else { 1 })
    }

    fn disposition_for(&self, error: RolewatchError, delivery: &Delivery) -> Disposition {
        match error {
            RolewatchError::MalformedObservation(_) | RolewatchError::Serialization(_) => {
                self.stats.record_malformed();
                tracing::warn!(
                    tag = delivery.tag,
                    routing_key = %delivery.routing_key,
                    "Dropping malformed message: {}",
                    error
                );
                Disposition::Ack
            }
            e if e.is_retryable() => {
                tracing::warn!(tag = delivery.tag, redelivered = delivery.redelivered, "Leaving message for redelivery: {}", e);
                Disposition::Requeue
            }
            e => {
                metrics::counter!("rolewatch_processing_errors_total", "kind" => e.kind()).increment(1);
                tracing::error!(tag = delivery.tag, "Dropping message: {}", e);
                Disposition::Ack
            }
        }
    }

    /// Extract, classify and merge one observation
    pub fn process(&self, payload: &[u8]) -> RolewatchResult<Transition> {
        let observation = Observation::from_slice(payload)
            .map_err(|e| RolewatchError::MalformedObservation(e.to_string()))?;
        let features = extract(&observation)?;
        let verdict = self.chain.load().classify(&features);

        let transition = self.store.merge(&verdict)?;
        if transition.duplicate {
            self.stats.record_duplicate();
        } else {
            self.stats.record_merged();
        }
        if transition.conflict {
            self.stats.record_conflict();
        }
        tracing::debug!(
            identity = %transition.identity,
            state = %transition.state,
            label = %transition.label,
            candidates = verdict.candidates.len(),
            duplicate = transition.duplicate,
            "Merged observation"
        );
        Ok(transition)
    }

    /// Report and enforce a merge result
    pub async fn apply_side_effects(&self, transition: &Transition) {
        if !transition.outcome.is_change() {
            return;
        }
        self.stats.record_transition();
        self.sink.publish(ReportEvent::Transition(transition.clone()));

        if let Some(label) = &transition.enforce {
            if let Err(e) = self.emitter.submit(transition.identity.clone(), label.clone()).await {
                // Still pending in the store; the sweeper resubmits it
                tracing::warn!(identity = %transition.identity, "Enforcement not queued: {}", e);
            }
        }
    }
}

/// Fixed-size set of workers
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers
    pub fn spawn(size: usize, ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) -> Self {
        let handles = (0..size)
            .map(|id| {
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { run_worker(id, ctx, shutdown).await })
            })
            .collect();
        tracing::info!("Worker pool started with {} workers", size);
        Self { handles }
    }

    /// Number of workers
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to finish its current message and exit
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task failed: {}", e);
            }
        }
    }
}

async fn run_worker(id: usize, ctx: Arc<WorkerContext>, shutdown: watch::Receiver<bool>) {
    tracing::debug!(worker = id, "Worker started");
    while !*shutdown.borrow() {
        match ctx.broker.receive(ctx.poll).await {
            Ok(Some(delivery)) => ctx.handle(delivery).await,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker = id, "Broker receive failed: {}", e);
                tokio::time::sleep(ctx.poll).await;
            }
        }
    }
    tracing::debug!(worker = id, "Worker stopped");
}
