//! Engine Configuration
//!
//! JSON file with every section optional, then environment overrides, then
//! validation.

use rolewatch_common::{RolewatchError, RolewatchResult};
use rolewatch_ml::ClassifierConfig;
use rolewatch_state::CoordinatorPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rolewatch/rolewatch.json";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool size
    pub workers: usize,
    /// Bounded broker poll, so workers notice shutdown
    pub poll_interval_ms: u64,
    /// Device store shards
    pub shard_count: usize,
    /// Device store capacity
    pub max_devices: usize,
    /// State machine policy
    pub policy: CoordinatorPolicy,
    /// Sweep period
    pub sweep_interval_secs: u64,
    /// Snapshot publication period (0 disables)
    pub snapshot_interval_secs: u64,
    /// Broker connection and topics
    pub broker: BrokerConfig,
    /// SDN controller
    pub controller: ControllerConfig,
    /// Classifier chain
    pub classifier: ClassifierConfig,
    /// Checkpoint file
    pub state_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: 250,
            shard_count: 64,
            max_devices: 1_000_000,
            policy: CoordinatorPolicy::default(),
            sweep_interval_secs: 30,
            snapshot_interval_secs: 60,
            broker: BrokerConfig::default(),
            controller: ControllerConfig::default(),
            classifier: ClassifierConfig::default(),
            state_path: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL (absent: in-process broker)
    pub url: Option<String>,
    /// Topic exchange
    pub exchange: String,
    /// Raw observation routing key
    pub observation_topic: String,
    /// Operator action routing key
    pub action_topic: String,
    /// Delay before a retryable failure goes back on the queue
    pub requeue: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            exchange: "topic-rolewatch".into(),
            observation_topic: "rolewatch.observations".into(),
            action_topic: "rolewatch.action".into(),
            requeue: RetryConfig { initial_ms: 250, max_ms: 2_000, ..Default::default() },
        }
    }
}

/// SDN controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller base URL (absent: commands are logged only)
    pub endpoint: Option<String>,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Label -> policy tag; unmapped labels use the label itself
    pub policy_tags: HashMap<String, String>,
    /// Commands delivered concurrently
    pub max_in_flight: usize,
    /// Retry backoff
    pub retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5_000,
            policy_tags: HashMap::new(),
            max_in_flight: 16,
            retry: RetryConfig::default(),
        }
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// First delay
    pub initial_ms: u64,
    /// Delay cap
    pub max_ms: u64,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Attempts per delivery cycle (including the first)
    pub max_attempts: u32,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_ms: 200,
            max_ms: 10_000,
            multiplier: 2.0,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.initial_ms as f64 * exp).min(self.max_ms as f64) as u64;
        let ms = if self.jitter && ms > 1 {
            use rand::Rng;
            rand::thread_rng().gen_range(ms / 2..=ms)
        } else {
            ms
        };
        Duration::from_millis(ms)
    }
}

impl EngineConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> RolewatchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load from `path`, falling back to defaults when it cannot be read,
    /// then apply environment overrides and validate
    pub fn resolve(path: &str) -> RolewatchResult<Self> {
        let mut config = Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Config {} not loaded ({}), using defaults", path, e);
            Self::default()
        });
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROLEWATCH_*` overrides from `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> RolewatchResult<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> RolewatchResult<T> {
            raw.trim()
                .parse()
                .map_err(|_| RolewatchError::Config(format!("{}: cannot parse {:?}", key, raw)))
        }

        if let Some(v) = lookup("ROLEWATCH_WORKERS") {
            self.workers = parse("ROLEWATCH_WORKERS", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_SHARDS") {
            self.shard_count = parse("ROLEWATCH_SHARDS", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_DECAY_LAMBDA") {
            self.policy.decay_lambda = parse("ROLEWATCH_DECAY_LAMBDA", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_CONFIRM_COUNT") {
            self.policy.confirm_count = parse("ROLEWATCH_CONFIRM_COUNT", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_RETENTION_SECS") {
            self.policy.retention_horizon_secs = parse("ROLEWATCH_RETENTION_SECS", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_SWEEP_INTERVAL_SECS") {
            self.sweep_interval_secs = parse("ROLEWATCH_SWEEP_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("ROLEWATCH_CONTROLLER_URL") {
            self.controller.endpoint = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("ROLEWATCH_BROKER_URL") {
            self.broker.url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("ROLEWATCH_STATE_PATH") {
            self.state_path = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = lookup("ROLEWATCH_MODEL_PATH") {
            self.classifier.model_path = Some(v).filter(|s| !s.is_empty());
        }
        Ok(())
    }

    /// Reject inconsistent values
    pub fn validate(&self) -> RolewatchResult<()> {
        if self.workers == 0 {
            return Err(RolewatchError::Config("workers must be at least 1".into()));
        }
        if self.shard_count == 0 {
            return Err(RolewatchError::Config("shard_count must be at least 1".into()));
        }
        if self.max_devices == 0 {
            return Err(RolewatchError::Config("max_devices must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 || self.sweep_interval_secs == 0 {
            return Err(RolewatchError::Config("poll and sweep intervals must be non-zero".into()));
        }
        if self.controller.retry.max_attempts == 0 || self.controller.max_in_flight == 0 {
            return Err(RolewatchError::Config(
                "controller max_attempts and max_in_flight must be at least 1".into(),
            ));
        }
        if self.broker.observation_topic == self.broker.action_topic {
            return Err(RolewatchError::Config("observation and action topics must differ".into()));
        }
        self.policy.validate()
    }

    /// Broker poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = EngineConfig::default();
        assert!(c.validate().is_ok());
        assert_eq!(c.policy.confirm_count, 3);
        assert_eq!(c.broker.action_topic, "rolewatch.action");
        assert!(c.broker.requeue.max_ms <= 2_000);
    }

    #[test]
    fn test_partial_file() {
        let c: EngineConfig = serde_json::from_str(
            r#"{"workers": 2, "policy": {"decay_lambda": 0.01}, "controller": {"endpoint": "http://sdn:8181"}}"#,
        )
        .unwrap();
        assert_eq!(c.workers, 2);
        assert_eq!(c.policy.decay_lambda, 0.01);
        assert_eq!(c.policy.confirm_count, 3);
        assert_eq!(c.controller.endpoint.as_deref(), Some("http://sdn:8181"));
        assert_eq!(c.controller.retry.max_attempts, 5);
    }

    #[test]
    fn test_env_overrides() {
        let mut c = EngineConfig::default();
        let env: HashMap<&str, &str> = [
            ("ROLEWATCH_WORKERS", "3"),
            ("ROLEWATCH_DECAY_LAMBDA", "0.05"),
            ("ROLEWATCH_CONTROLLER_URL", "http://controller"),
        ]
        .into_iter()
        .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.workers, 3);
        assert_eq!(c.policy.decay_lambda, 0.05);
        assert_eq!(c.controller.endpoint.as_deref(), Some("http://controller"));

        let bad = c.apply_env(|k| (k == "ROLEWATCH_WORKERS").then(|| "many".to_string()));
        assert!(matches!(bad, Err(RolewatchError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let c = EngineConfig { workers: 0, ..Default::default() };
        assert!(c.validate().is_err());

        let mut c = EngineConfig::default();
        c.broker.action_topic = c.broker.observation_topic.clone();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_retry_delay_is_bounded() {
        let r = RetryConfig { jitter: false, ..Default::default() };
        assert_eq!(r.delay(1), Duration::from_millis(200));
        assert_eq!(r.delay(2), Duration::from_millis(400));
        assert_eq!(r.delay(20), Duration::from_millis(10_000));

        let r = RetryConfig::default();
        let d = r.delay(3);
        assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(800));
    }
}
