//! Classification engine
//!
//! Wires the worker pool, enforcement emitter and sweeper around one shared
//! [`DeviceStore`].
//!
//! ```text
//! broker ──► WorkerPool (N tasks) ──► DeviceStore::merge ──► ReportingSink
//!                                            │
//!                                            └──► EnforcementEmitter ──► SDN controller
//! Sweeper (interval) ──► DeviceStore::sweep ──► evictions, resubmission, checkpoint
//! ```

pub mod actions;
pub mod broker;
pub mod config;
pub mod emitter;
pub mod report;
pub mod stats;
pub mod sweeper;
pub mod worker;

pub use actions::{ActionResult, OperatorAction};
pub use broker::{Broker, Delivery, InMemoryBroker};
pub use config::{BrokerConfig, ControllerConfig, EngineConfig, RetryConfig};
pub use emitter::{
    controller_from_config, ControllerError, EmitterHandle, EnforceOutcome, EnforcementCommand,
    EnforcementEmitter, HttpController, IdempotencyKey, LoggingController, SdnController,
};
pub use report::{BroadcastSink, LogSink, ReportEvent, ReportingSink};
pub use stats::{EngineStats, EngineStatsSnapshot};
pub use sweeper::{SweepSummary, Sweeper};
pub use worker::{WorkerContext, WorkerPool};

use arc_swap::ArcSwap;
use rolewatch_common::{RolewatchError, RolewatchResult, Timestamp};
use rolewatch_ml::StageChain;
use rolewatch_state::{persist, DeviceStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Commands queued per worker before submitters wait
const EMITTER_QUEUE_PER_WORKER: usize = 64;

struct Running {
    workers: WorkerPool,
    emitter: JoinHandle<()>,
    sweeper: Arc<Sweeper>,
    sweeper_task: JoinHandle<()>,
}

/// Classification engine
pub struct Engine {
    config: EngineConfig,
    store: Arc<DeviceStore>,
    chain: Arc<ArcSwap<StageChain>>,
    broker: Arc<dyn Broker>,
    controller: Arc<dyn SdnController>,
    sink: Arc<dyn ReportingSink>,
    stats: Arc<EngineStats>,
    shutdown: watch::Sender<bool>,
    running: Option<Running>,
}

impl Engine {
    /// Create engine (nothing runs until [`Engine::start`])
    pub fn new(
        config: EngineConfig,
        broker: Arc<dyn Broker>,
        controller: Arc<dyn SdnController>,
        sink: Arc<dyn ReportingSink>,
    ) -> RolewatchResult<Self> {
        config.validate()?;

        let store = Arc::new(DeviceStore::new(config.policy.clone(), config.shard_count, config.max_devices));
        let chain = StageChain::standard(&config.classifier);
        tracing::info!("Classifier chain v{} with {} stages", chain.version(), chain.stage_count());
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            chain: Arc::new(ArcSwap::from_pointee(chain)),
            broker,
            controller,
            sink,
            stats: Arc::new(EngineStats::default()),
            shutdown,
            running: None,
        })
    }

    /// Restore state, then start the emitter, sweeper and workers
    pub async fn start(&mut self) -> RolewatchResult<()> {
        if self.running.is_some() {
            return Err(RolewatchError::Config("engine already running".into()));
        }

        if let Some(path) = self.config.state_path.as_deref() {
            match persist::restore(&self.store, path) {
                Ok(n) if n > 0 => tracing::info!("Loaded {} records from {}", n, path),
                Ok(_) => {}
                Err(e) => tracing::warn!("Checkpoint {} not restored, starting empty: {}", path, e),
            }
        }

        let (handle, rx) = EmitterHandle::channel(self.config.workers * EMITTER_QUEUE_PER_WORKER);
        let emitter = Arc::new(EnforcementEmitter::new(
            self.controller.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.stats.clone(),
            &self.config.controller,
        ));
        let emitter = emitter.spawn(rx, self.shutdown.subscribe());

        let sweeper = Arc::new(Sweeper::new(
            self.store.clone(),
            self.sink.clone(),
            handle.clone(),
            self.stats.clone(),
            self.config.state_path.clone(),
        ));
        sweeper.resubmit_pending().await;
        let snapshot_every = (self.config.snapshot_interval_secs > 0)
            .then(|| Duration::from_secs(self.config.snapshot_interval_secs));
        let sweeper_task = sweeper.clone().spawn(
            self.config.sweep_interval(),
            snapshot_every,
            self.shutdown.subscribe(),
        );

        let ctx = Arc::new(WorkerContext {
            broker: self.broker.clone(),
            chain: self.chain.clone(),
            store: self.store.clone(),
            emitter: handle,
            sink: self.sink.clone(),
            stats: self.stats.clone(),
            action_topic: self.config.broker.action_topic.clone(),
            poll: self.config.poll_interval(),
            requeue: self.config.broker.requeue.clone(),
        });
        let workers = WorkerPool::spawn(self.config.workers, ctx, self.shutdown.subscribe());

        self.running = Some(Running { workers, emitter, sweeper, sweeper_task });
        tracing::info!(
            workers = self.config.workers,
            shards = self.config.shard_count,
            devices = self.store.len(),
            "Engine started"
        );
        Ok(())
    }

    /// Stop accepting messages, let in-flight merges finish, write a final
    /// checkpoint
    pub async fn shutdown(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!("Engine shutting down");
        let _ = self.shutdown.send(true);

        running.workers.join().await;
        if let Err(e) = running.sweeper_task.await {
            tracing::error!("Sweeper task failed: {}", e);
        }
        if let Err(e) = running.emitter.await {
            tracing::error!("Emitter task failed: {}", e);
        }
        running.sweeper.checkpoint(Timestamp::now()).await;

        let stats = self.stats.snapshot();
        tracing::info!(
            received = stats.received,
            merged = stats.merged,
            duplicates = stats.duplicates,
            malformed = stats.malformed,
            devices = self.store.len(),
            "Engine stopped"
        );
    }

    /// Install a new classifier chain; workers pick it up on their next message
    pub fn install_chain(&self, chain: StageChain) {
        tracing::info!("Installing classifier chain v{}", chain.version());
        self.chain.store(Arc::new(chain));
    }

    /// Installed chain version
    pub fn chain_version(&self) -> u32 {
        self.chain.load().version()
    }

    /// Device store
    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    /// Counters
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Configuration in effect
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether started and not shut down
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}
