//! Coordinator policy parameters

use rolewatch_common::{RolewatchError, RolewatchResult};
use serde::{Deserialize, Serialize};

/// Thresholds, windows and horizons driving the device state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorPolicy {
    /// Decay rate λ per second
    pub decay_lambda: f64,
    /// Minimum candidate confidence to leave NEW or count toward N
    pub min_confidence: f32,
    /// Consistent candidates required to confirm (N)
    pub confirm_count: usize,
    /// Sliding confirmation window
    pub confirm_window_secs: u64,
    /// Disagreeing confidence that resets a window or opens a contest
    pub disagreement_threshold: f32,
    /// Contest settling period before the vote is counted
    pub contest_settle_secs: u64,
    /// Confirmed records below this decayed confidence become stale
    pub low_watermark: f32,
    /// Idle time after which a settled record is evicted
    pub retention_horizon_secs: u64,
    /// Bounded history length per record
    pub history_len: usize,
    /// Remembered observation timestamps per record, for duplicate detection
    pub dedup_len: usize,
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self {
            decay_lambda: 0.001,
            min_confidence: 0.5,
            confirm_count: 3,
            confirm_window_secs: 300,
            disagreement_threshold: 0.7,
            contest_settle_secs: 60,
            low_watermark: 0.2,
            retention_horizon_secs: 86_400,
            history_len: 32,
            dedup_len: 256,
        }
    }
}

impl CoordinatorPolicy {
    /// Reject inconsistent values
    pub fn validate(&self) -> RolewatchResult<()> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(RolewatchError::Config(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };
        unit("min_confidence", self.min_confidence)?;
        unit("disagreement_threshold", self.disagreement_threshold)?;
        unit("low_watermark", self.low_watermark)?;

        if !self.decay_lambda.is_finite() || self.decay_lambda < 0.0 {
            return Err(RolewatchError::Config(format!(
                "decay_lambda must be a non-negative number, got {}",
                self.decay_lambda
            )));
        }
        if self.low_watermark >= self.min_confidence {
            return Err(RolewatchError::Config(
                "low_watermark must be below min_confidence".into(),
            ));
        }
        if self.confirm_count == 0 {
            return Err(RolewatchError::Config("confirm_count must be at least 1".into()));
        }
        if self.history_len == 0 || self.dedup_len == 0 {
            return Err(RolewatchError::Config("history_len and dedup_len must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(CoordinatorPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        let p = CoordinatorPolicy { low_watermark: 0.6, ..Default::default() };
        assert!(p.validate().is_err());

        let p = CoordinatorPolicy { confirm_count: 0, ..Default::default() };
        assert!(p.validate().is_err());

        let p = CoordinatorPolicy { disagreement_threshold: 1.5, ..Default::default() };
        assert!(p.validate().is_err());

        let p = CoordinatorPolicy { decay_lambda: f64::NAN, ..Default::default() };
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let p: CoordinatorPolicy = serde_json::from_str(r#"{"confirm_count": 5}"#).unwrap();
        assert_eq!(p.confirm_count, 5);
        assert_eq!(p.history_len, 32);
    }
}
