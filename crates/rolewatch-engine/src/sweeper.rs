//! Sweeper
//!
//! Periodic, cancellable maintenance: decay and contest settlement via the
//! store sweep, eviction reports, resubmission of pending enforcement,
//! checkpoints and snapshot publication.

use crate::emitter::EmitterHandle;
use crate::report::{ReportEvent, ReportingSink};
use crate::stats::EngineStats;
use rolewatch_common::Timestamp;
use rolewatch_state::{persist, DeviceStore, Transition};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Result of one sweep pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    /// Shards visited
    pub shards: usize,
    /// State changes reported
    pub transitions: usize,
    /// Records evicted
    pub evicted: usize,
    /// Pending commands resubmitted
    pub resubmitted: usize,
    /// Stopped early by shutdown
    pub cancelled: bool,
}

/// Periodic maintenance task
pub struct Sweeper {
    store: Arc<DeviceStore>,
    sink: Arc<dyn ReportingSink>,
    emitter: EmitterHandle,
    stats: Arc<EngineStats>,
    state_path: Option<String>,
}

impl Sweeper {
    /// Create sweeper
    pub fn new(
        store: Arc<DeviceStore>,
        sink: Arc<dyn ReportingSink>,
        emitter: EmitterHandle,
        stats: Arc<EngineStats>,
        state_path: Option<String>,
    ) -> Self {
        Self { store, sink, emitter, stats, state_path }
    }

    /// Sweep every shard at `now`, stopping between shards on shutdown
    pub async fn sweep_once(&self, now: Timestamp, shutdown: &watch::Receiver<bool>) -> SweepSummary {
        let mut summary = SweepSummary::default();

        for idx in 0..self.store.shard_count() {
            if *shutdown.borrow() {
                summary.cancelled = true;
                break;
            }
            let report = self.store.sweep_shard(idx, now);
            summary.shards += 1;

            for t in &report.transitions {
                self.publish(t).await;
            }
            summary.transitions += report.transitions.len();

            if !report.evicted.is_empty() {
                self.stats.record_evictions(report.evicted.len() as u64);
                summary.evicted += report.evicted.len();
                for t in report.evicted {
                    tracing::debug!(identity = %t.identity, "Evicted");
                    self.sink.publish(ReportEvent::Transition(t));
                }
            }
        }

        if !summary.cancelled {
            summary.resubmitted = self.resubmit_pending().await;
            self.stats.record_sweep();
        }
        self.checkpoint(now).await;

        tracing::debug!(?summary, devices = self.store.len(), "Sweep complete");
        summary
    }

    async fn publish(&self, transition: &Transition) {
        self.stats.record_transition();
        self.sink.publish(ReportEvent::Transition(transition.clone()));
        if let Some(label) = &transition.enforce {
            if let Err(e) = self.emitter.submit(transition.identity.clone(), label.clone()).await {
                tracing::warn!(identity = %transition.identity, "Enforcement not queued: {}", e);
            }
        }
    }

    /// Queue every command still pending (startup and after each sweep)
    pub async fn resubmit_pending(&self) -> usize {
        let pending = self.store.pending_enforcements();
        let count = pending.len();
        for (identity, label) in pending {
            if let Err(e) = self.emitter.submit(identity, label).await {
                tracing::warn!("Pending enforcement not resubmitted: {}", e);
                break;
            }
        }
        if count > 0 {
            tracing::info!("Resubmitted {} pending enforcement commands", count);
        }
        count
    }

    /// Write a checkpoint if a state path is configured
    ///
    /// Serialisation and file IO run on the blocking pool.
    pub async fn checkpoint(&self, now: Timestamp) {
        let Some(path) = self.state_path.clone() else {
            return;
        };
        let store = self.store.clone();
        let target = path.clone();
        match tokio::task::spawn_blocking(move || persist::save(&store, &target, now)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Checkpoint {} failed: {}", path, e),
            Err(e) => tracing::error!("Checkpoint task for {} failed: {}", path, e),
        }
    }

    /// Publish a full snapshot with per-state counts
    pub fn publish_snapshot(&self, now: Timestamp) {
        let devices = self.store.snapshot(now);
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for d in &devices {
            *counts.entry(d.state.to_string()).or_insert(0) += 1;
        }
        self.sink.publish(ReportEvent::Snapshot { at: now, counts, devices });
    }

    /// Run until shutdown
    pub fn spawn(
        self: Arc<Self>,
        sweep_every: Duration,
        snapshot_every: Option<Duration>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_tick = tokio::time::interval(sweep_every);
            sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            sweep_tick.tick().await;

            // A disabled snapshot timer still needs a future to select on
            let mut snapshot_tick = tokio::time::interval(snapshot_every.unwrap_or(Duration::from_secs(3600)));
            snapshot_tick.tick().await;
            let cancel = shutdown.clone();

            loop {
                tokio::select! {
                    _ = sweep_tick.tick() => {
                        self.sweep_once(Timestamp::now(), &cancel).await;
                    }
                    _ = snapshot_tick.tick(), if snapshot_every.is_some() => {
                        self.publish_snapshot(Timestamp::now());
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("Sweeper stopped");
        })
    }
}
