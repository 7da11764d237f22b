//! Enforcement Emitter
//!
//! Turns confirmed transitions into idempotent controller commands keyed by
//! (identity, label). Unavailability is retried with bounded backoff; a
//! rejection is recorded as `failed` and not retried. A cycle that runs out
//! of attempts leaves the record pending, and the sweeper resubmits it.
//! Every attempt first checks that the record still awaits the key's label;
//! a key superseded by a newer transition is never sent.

use crate::config::{ControllerConfig, RetryConfig};
use crate::report::{ReportEvent, ReportingSink};
use crate::stats::EngineStats;
use dashmap::DashSet;
use rolewatch_common::{DeviceId, Label, RolewatchError, RolewatchResult, Timestamp};
use rolewatch_state::{DeviceStore, EnforcementResult, EnforcementStatus, Transition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

/// Idempotency key: the controller treats repeats as no-ops
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    /// Device identity
    pub identity: DeviceId,
    /// Target label
    pub label: Label,
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.identity, self.label)
    }
}

/// Command sent to the SDN controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementCommand {
    /// Device identity
    pub identity: DeviceId,
    /// Target label
    pub label: Label,
    /// Controller policy tag for the label
    pub policy_tag: String,
    /// Idempotency key
    pub idempotency_key: IdempotencyKey,
    /// Unique per attempt, for controller-side tracing
    pub request_id: uuid::Uuid,
    /// Issue time
    pub issued_at: Timestamp,
}

/// Controller failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Network or controller unavailability
    #[error("controller unavailable: {0}")]
    Unavailable(String),
    /// Rejected by controller policy
    #[error("controller rejected command: {0}")]
    Rejected(String),
}

impl From<ControllerError> for RolewatchError {
    fn from(e: ControllerError) -> Self {
        match e {
            ControllerError::Unavailable(m) => RolewatchError::EnforcementRetryable(m),
            ControllerError::Rejected(m) => RolewatchError::EnforcementPermanent(m),
        }
    }
}

/// SDN controller client
#[async_trait::async_trait]
pub trait SdnController: Send + Sync {
    /// Apply one command
    async fn apply(&self, command: &EnforcementCommand) -> Result<(), ControllerError>;

    /// Client name
    fn name(&self) -> &str;
}

/// HTTP controller: `POST {endpoint}/v1/enforcement`
pub struct HttpController {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpController {
    /// Create client
    pub fn new(endpoint: &str, timeout: Duration) -> RolewatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RolewatchError::Config(format!("controller client: {}", e)))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl SdnController for HttpController {
    async fn apply(&self, command: &EnforcementCommand) -> Result<(), ControllerError> {
        let response = self
            .client
            .post(format!("{}/v1/enforcement", self.endpoint))
            .header("Idempotency-Key", command.idempotency_key.to_string())
            .header("X-Request-Id", command.request_id.to_string())
            .json(command)
            .send()
            .await
            .map_err(|e| ControllerError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let reason = format!("{} {}", status, body.trim());
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(ControllerError::Unavailable(reason))
        } else {
            Err(ControllerError::Rejected(reason))
        }
    }

    fn name(&self) -> &str {
        &self.endpoint
    }
}

/// Accepts every command and logs it
#[derive(Debug, Default)]
pub struct LoggingController;

#[async_trait::async_trait]
impl SdnController for LoggingController {
    async fn apply(&self, command: &EnforcementCommand) -> Result<(), ControllerError> {
        tracing::info!(
            identity = %command.identity,
            policy = %command.policy_tag,
            key = %command.idempotency_key,
            "Enforcement (no controller configured)"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Controller selected by configuration
pub fn controller_from_config(config: &ControllerConfig) -> RolewatchResult<Arc<dyn SdnController>> {
    match config.endpoint.as_deref() {
        Some(endpoint) => Ok(Arc::new(HttpController::new(
            endpoint,
            Duration::from_millis(config.timeout_ms),
        )?)),
        None => Ok(Arc::new(LoggingController)),
    }
}

/// Result of one delivery cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforceOutcome {
    /// Controller accepted
    Applied,
    /// Controller rejected; recorded as failed
    Rejected(String),
    /// Attempts exhausted; still pending
    Exhausted(String),
    /// Shutdown interrupted the backoff; still pending
    Interrupted,
    /// The record no longer awaits this label; nothing recorded
    Superseded,
}

/// Delivers commands and records the answers
pub struct EnforcementEmitter {
    controller: Arc<dyn SdnController>,
    store: Arc<DeviceStore>,
    sink: Arc<dyn ReportingSink>,
    stats: Arc<EngineStats>,
    retry: RetryConfig,
    policy_tags: HashMap<String, String>,
    in_flight: DashSet<IdempotencyKey>,
    max_in_flight: usize,
}

impl EnforcementEmitter {
    /// Create emitter
    pub fn new(
        controller: Arc<dyn SdnController>,
        store: Arc<DeviceStore>,
        sink: Arc<dyn ReportingSink>,
        stats: Arc<EngineStats>,
        config: &ControllerConfig,
    ) -> Self {
        tracing::info!("Enforcement via controller {}", controller.name());
        Self {
            controller,
            store,
            sink,
            stats,
            retry: config.retry.clone(),
            policy_tags: config.policy_tags.clone(),
            in_flight: DashSet::new(),
            max_in_flight: config.max_in_flight.max(1),
        }
    }

    fn command(&self, key: &IdempotencyKey) -> EnforcementCommand {
        let policy_tag = self
            .policy_tags
            .get(key.label.as_str())
            .cloned()
            .unwrap_or_else(|| key.label.to_string());
        EnforcementCommand {
            identity: key.identity.clone(),
            label: key.label.clone(),
            policy_tag,
            idempotency_key: key.clone(),
            request_id: uuid::Uuid::new_v4(),
            issued_at: Timestamp::now(),
        }
    }

    /// Enforce a transition's target label, if it has one
    pub async fn enforce_transition(&self, transition: &Transition) -> Option<EnforceOutcome> {
        let label = transition.enforce.as_ref()?;
        let key = IdempotencyKey { identity: transition.identity.clone(), label: label.clone() };
        let (_tx, mut shutdown) = watch::channel(false);
        Some(self.enforce(key, &mut shutdown).await)
    }

    /// One delivery cycle with bounded backoff
    pub async fn enforce(&self, key: IdempotencyKey, shutdown: &mut watch::Receiver<bool>) -> EnforceOutcome {
        let mut attempt = 1;
        loop {
            if !self.store.is_enforcement_pending(&key.identity, &key.label) {
                tracing::debug!(key = %key, attempt, "Enforcement superseded, not sent");
                return EnforceOutcome::Superseded;
            }
            let command = self.command(&key);
            self.stats.record_enforcement_sent();
            let result = self.controller.apply(&command).await;

            match result {
                Ok(()) => {
                    self.stats.record_enforcement_applied();
                    if !self.settle(&key, EnforcementResult::Applied) {
                        return EnforceOutcome::Superseded;
                    }
                    tracing::debug!(key = %key, attempt, "Enforcement applied");
                    return EnforceOutcome::Applied;
                }
                Err(ControllerError::Rejected(reason)) => {
                    self.stats.record_enforcement_failed();
                    tracing::error!(key = %key, "Enforcement rejected: {}", reason);
                    if !self.settle(&key, EnforcementResult::Rejected(reason.clone())) {
                        return EnforceOutcome::Superseded;
                    }
                    return EnforceOutcome::Rejected(reason);
                }
                Err(ControllerError::Unavailable(reason)) if attempt >= self.retry.max_attempts => {
                    self.stats.record_enforcement_exhausted();
                    tracing::warn!(
                        key = %key,
                        "Enforcement gave up after {} attempts, stays pending: {}",
                        attempt,
                        reason
                    );
                    return EnforceOutcome::Exhausted(reason);
                }
                Err(ControllerError::Unavailable(reason)) => {
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(key = %key, attempt, ?delay, "Controller unavailable: {}", reason);
                    self.stats.record_enforcement_retry();
                    attempt += 1;

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return EnforceOutcome::Interrupted,
                    }
                }
            }
        }
    }

    fn settle(&self, key: &IdempotencyKey, result: EnforcementResult) -> bool {
        let status = match &result {
            EnforcementResult::Applied => EnforcementStatus::Applied { label: key.label.clone() },
            EnforcementResult::Rejected(reason) => EnforcementStatus::Failed {
                label: key.label.clone(),
                reason: reason.clone(),
            },
        };
        if !self.store.settle_enforcement(&key.identity, &key.label, result) {
            tracing::warn!(key = %key, "Controller answered a superseded command");
            return false;
        }
        self.sink.publish(ReportEvent::Enforcement {
            identity: key.identity.clone(),
            label: key.label.clone(),
            status,
        });
        true
    }

    /// Run the delivery loop until shutdown, delivering up to
    /// `max_in_flight` commands concurrently
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<IdempotencyKey>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(self.max_in_flight));
            let mut tasks = tokio::task::JoinSet::new();
            let mut stop = shutdown.clone();

            loop {
                let key = tokio::select! {
                    key = rx.recv() => match key {
                        Some(key) => key,
                        None => break,
                    },
                    Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
                    _ = stop.changed() => break,
                };

                if !self.in_flight.insert(key.clone()) {
                    continue;
                }
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let emitter = self.clone();
                let mut shutdown = shutdown.clone();
                tasks.spawn(async move {
                    emitter.enforce(key.clone(), &mut shutdown).await;
                    emitter.in_flight.remove(&key);
                    drop(permit);
                });
            }

            // Let in-flight deliveries finish (backoffs end on shutdown)
            while tasks.join_next().await.is_some() {}
            tracing::info!("Enforcement emitter stopped");
        })
    }
}

/// Cloneable submission handle
#[derive(Clone)]
pub struct EmitterHandle {
    tx: mpsc::Sender<IdempotencyKey>,
}

impl EmitterHandle {
    /// Create handle and receiver with queue `capacity`
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IdempotencyKey>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a command; waits while the queue is full
    pub async fn submit(&self, identity: DeviceId, label: Label) -> RolewatchResult<()> {
        self.tx
            .send(IdempotencyKey { identity, label })
            .await
            .map_err(|_| RolewatchError::EnforcementRetryable("emitter stopped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::BroadcastSink;
    use parking_lot::Mutex;
    use rolewatch_ml::{Candidate, Verdict};
    use rolewatch_state::CoordinatorPolicy;

    /// Answers from a script, then succeeds
    struct Scripted {
        answers: Mutex<Vec<Result<(), ControllerError>>>,
        seen: Mutex<Vec<EnforcementCommand>>,
    }

    impl Scripted {
        fn new(mut answers: Vec<Result<(), ControllerError>>) -> Self {
            answers.reverse();
            Self { answers: Mutex::new(answers), seen: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait::async_trait]
    impl SdnController for Scripted {
        async fn apply(&self, command: &EnforcementCommand) -> Result<(), ControllerError> {
            self.seen.lock().push(command.clone());
            self.answers.lock().pop().unwrap_or(Ok(()))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn confirmed_store(id: &DeviceId) -> Arc<DeviceStore> {
        let store = Arc::new(DeviceStore::new(CoordinatorPolicy::default(), 4, 100));
        for secs in [1, 2, 3] {
            let at = Timestamp::from_secs(secs);
            store
                .merge(&Verdict {
                    identity: id.clone(),
                    observed_at: at,
                    fingerprint: secs,
                    candidates: vec![Candidate::new(Label::new("printer"), 0.9, "test", at)],
                    degraded: Vec::new(),
                })
                .unwrap();
        }
        store
    }

    fn emitter(controller: Arc<Scripted>, store: Arc<DeviceStore>, attempts: u32) -> EnforcementEmitter {
        let mut config = ControllerConfig::default();
        config.retry = RetryConfig { initial_ms: 1, max_ms: 5, max_attempts: attempts, jitter: false, ..Default::default() };
        config.policy_tags.insert("printer".into(), "vlan-printers".into());
        EnforcementEmitter::new(controller, store, Arc::new(BroadcastSink::new(8)), Arc::new(EngineStats::default()), &config)
    }

    fn key(id: &DeviceId) -> IdempotencyKey {
        IdempotencyKey { identity: id.clone(), label: Label::new("printer") }
    }

    #[tokio::test]
    async fn test_retry_then_apply() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let controller = Arc::new(Scripted::new(vec![
            Err(ControllerError::Unavailable("down".into())),
            Err(ControllerError::Unavailable("down".into())),
        ]));
        let e = emitter(controller.clone(), store.clone(), 5);
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(e.enforce(key(&id), &mut shutdown).await, EnforceOutcome::Applied);
        let seen = controller.seen.lock();
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|c| c.idempotency_key == key(&id)));
        assert_eq!(seen[0].policy_tag, "vlan-printers");
        assert_ne!(seen[0].request_id, seen[1].request_id);
        assert_eq!(e.stats.snapshot().enforcement_retries, 2);
        assert!(store.pending_enforcements().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_marks_failed() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let controller = Arc::new(Scripted::new(vec![Err(ControllerError::Rejected("no such vlan".into()))]));
        let e = emitter(controller.clone(), store.clone(), 5);
        let (_tx, mut shutdown) = watch::channel(false);

        let outcome = e.enforce(key(&id), &mut shutdown).await;
        assert!(matches!(outcome, EnforceOutcome::Rejected(_)));
        assert_eq!(controller.seen.lock().len(), 1);
        let snap = store.get(&id, Timestamp::from_secs(4)).unwrap();
        assert!(matches!(snap.enforcement, EnforcementStatus::Failed { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_stays_pending() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let controller = Arc::new(Scripted::new(vec![
            Err(ControllerError::Unavailable("down".into())),
            Err(ControllerError::Unavailable("down".into())),
            Err(ControllerError::Unavailable("down".into())),
        ]));
        let e = emitter(controller.clone(), store.clone(), 2);
        let (_tx, mut shutdown) = watch::channel(false);

        let outcome = e.enforce(key(&id), &mut shutdown).await;
        assert!(matches!(outcome, EnforceOutcome::Exhausted(_)));
        assert_eq!(controller.seen.lock().len(), 2);
        assert_eq!(store.pending_enforcements().len(), 1);
    }

    #[tokio::test]
    async fn test_transition_without_target_is_skipped() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let controller = Arc::new(Scripted::new(Vec::new()));
        let e = emitter(controller.clone(), store.clone(), 2);

        let at = Timestamp::from_secs(9);
        let t = store
            .merge(&Verdict {
                identity: id.clone(),
                observed_at: at,
                fingerprint: 9,
                candidates: vec![Candidate::new(Label::new("printer"), 0.9, "test", at)],
                degraded: Vec::new(),
            })
            .unwrap();
        assert!(e.enforce_transition(&t).await.is_none());
        assert!(controller.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_loop_delivers_submissions() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let controller = Arc::new(Scripted::new(Vec::new()));
        let e = Arc::new(emitter(controller.clone(), store.clone(), 2));
        let (handle, rx) = EmitterHandle::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = e.spawn(rx, stop_rx);

        handle.submit(id.clone(), Label::new("printer")).await.unwrap();
        for _ in 0..100 {
            if store.pending_enforcements().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(store.pending_enforcements().is_empty());

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(controller.seen.lock().len(), 1);
    }

    fn relabel(store: &DeviceStore, id: &DeviceId, label: &str) {
        let mut record = store.record(id).unwrap();
        record.label = Label::new(label);
        record.enforcement = EnforcementStatus::Pending { label: Label::new(label) };
        store.restore(vec![record], Vec::new());
    }

    /// Moves the device to `camera` while answering its first command
    struct Relabeling {
        store: Arc<DeviceStore>,
        first: Mutex<Option<Result<(), ControllerError>>>,
        seen: Mutex<Vec<EnforcementCommand>>,
    }

    #[async_trait::async_trait]
    impl SdnController for Relabeling {
        async fn apply(&self, command: &EnforcementCommand) -> Result<(), ControllerError> {
            self.seen.lock().push(command.clone());
            match self.first.lock().take() {
                Some(answer) => {
                    relabel(&self.store, &command.identity, "camera");
                    answer
                }
                None => Ok(()),
            }
        }

        fn name(&self) -> &str {
            "relabeling"
        }
    }

    fn relabeling_emitter(store: Arc<DeviceStore>, first: Result<(), ControllerError>) -> (Arc<Relabeling>, EnforcementEmitter) {
        let controller = Arc::new(Relabeling {
            store: store.clone(),
            first: Mutex::new(Some(first)),
            seen: Mutex::new(Vec::new()),
        });
        let mut config = ControllerConfig::default();
        config.retry = RetryConfig { initial_ms: 1, max_ms: 5, max_attempts: 5, jitter: false, ..Default::default() };
        let e = EnforcementEmitter::new(
            controller.clone(),
            store,
            Arc::new(BroadcastSink::new(8)),
            Arc::new(EngineStats::default()),
            &config,
        );
        (controller, e)
    }

    #[tokio::test]
    async fn test_superseded_key_is_never_sent() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        relabel(&store, &id, "camera");
        let controller = Arc::new(Scripted::new(Vec::new()));
        let e = emitter(controller.clone(), store.clone(), 3);
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(e.enforce(key(&id), &mut shutdown).await, EnforceOutcome::Superseded);
        assert!(controller.seen.lock().is_empty());

        let camera = IdempotencyKey { identity: id.clone(), label: Label::new("camera") };
        assert_eq!(e.enforce(camera, &mut shutdown).await, EnforceOutcome::Applied);
        let seen = controller.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].label, Label::new("camera"));
        assert_eq!(store.record(&id).unwrap().enforcement, EnforcementStatus::Applied { label: Label::new("camera") });
    }

    #[tokio::test]
    async fn test_retry_stops_once_label_moves() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let (controller, e) = relabeling_emitter(store.clone(), Err(ControllerError::Unavailable("down".into())));
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(e.enforce(key(&id), &mut shutdown).await, EnforceOutcome::Superseded);
        assert_eq!(controller.seen.lock().len(), 1);
        assert_eq!(store.record(&id).unwrap().enforcement, EnforcementStatus::Pending { label: Label::new("camera") });
    }

    #[tokio::test]
    async fn test_late_answer_is_not_reported_applied() {
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let store = confirmed_store(&id);
        let (_controller, e) = relabeling_emitter(store.clone(), Ok(()));
        let (_tx, mut shutdown) = watch::channel(false);

        assert_eq!(e.enforce(key(&id), &mut shutdown).await, EnforceOutcome::Superseded);
        assert_eq!(store.pending_enforcements(), vec![(id, Label::new("camera"))]);
    }

    #[test]
    fn test_controller_error_maps_to_taxonomy() {
        let e: RolewatchError = ControllerError::Unavailable("x".into()).into();
        assert!(e.is_retryable());
        let e: RolewatchError = ControllerError::Rejected("x".into()).into();
        assert!(!e.is_retryable());
    }
}
