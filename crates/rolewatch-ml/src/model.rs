//! Model weights
//!
//! Loaded once at startup and shared read-only behind an `Arc`; nothing
//! mutates weights at runtime, so the hot path needs no synchronization.

use crate::FEATURE_DIM;
use rolewatch_common::{RolewatchError, RolewatchResult};
use serde::{Deserialize, Serialize};

/// Softmax model weights: one row per label
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Weights version, reported as the chain version
    pub version: u32,
    /// Output labels
    pub labels: Vec<String>,
    /// Weight matrix, `labels.len()` rows of `FEATURE_DIM`
    pub weights: Vec<Vec<f32>>,
    /// Per-label bias
    pub bias: Vec<f32>,
}

impl ModelWeights {
    /// Load and validate weights from a JSON file
    pub fn load(path: &str) -> RolewatchResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let weights: Self = serde_json::from_str(&content)?;
        weights.validate()?;
        Ok(weights)
    }

    /// Check matrix shape
    pub fn validate(&self) -> RolewatchResult<()> {
        if self.labels.is_empty() {
            return Err(RolewatchError::Config("model has no labels".into()));
        }
        if self.weights.len() != self.labels.len() || self.bias.len() != self.labels.len() {
            return Err(RolewatchError::Config(format!(
                "model shape mismatch: {} labels, {} rows, {} biases",
                self.labels.len(),
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(row) = self.weights.iter().position(|r| r.len() != FEATURE_DIM) {
            return Err(RolewatchError::Config(format!(
                "model row {} has {} weights, expected {}",
                row,
                self.weights[row].len(),
                FEATURE_DIM
            )));
        }
        Ok(())
    }

    /// Built-in weights used when no model file is configured
    pub fn builtin() -> Self {
        //            bytes pkts  mean  tcp  udp  oth  <1k  prn  strm adm  sip  disc ent  prnt rate cmpl
        let rows: [(&str, [f32; FEATURE_DIM], f32); 6] = [
            ("workstation", [0.5, 0.3, 0.2, 0.5, 0.2, 0.0, 0.2, -1.0, -0.5, 0.5, -0.5, 0.0, 1.5, 0.0, 0.3, 0.0], 0.3),
            ("printer", [0.3, 0.0, 0.5, 0.5, 0.0, 0.0, 0.0, 4.0, -1.0, -0.5, -1.0, 0.3, -0.5, 1.5, 0.0, 0.0], -0.5),
            ("camera", [0.8, 0.5, 1.5, 0.3, 0.5, 0.0, 0.0, -1.0, 4.0, 0.0, -0.5, 0.0, 0.5, -0.5, 1.5, 0.0], -0.5),
            ("server", [0.5, 0.5, 0.5, 0.8, 0.0, 0.0, 1.0, -0.5, -0.5, 3.0, -0.5, -0.5, 0.8, 0.3, 0.5, 0.0], -0.5),
            ("voip-phone", [0.0, 0.3, -0.5, 0.0, 1.5, 0.0, 0.0, -1.0, 0.0, -0.5, 4.0, 0.0, 0.0, 1.0, 0.0, 0.0], -0.8),
            ("iot", [-0.5, -0.3, -1.0, 0.0, 1.0, 0.5, 0.0, -0.5, -0.5, -0.5, -0.5, 3.5, 0.0, 0.3, -0.5, 0.0], -0.5),
        ];

        Self {
            version: 1,
            labels: rows.iter().map(|(l, _, _)| l.to_string()).collect(),
            weights: rows.iter().map(|(_, w, _)| w.to_vec()).collect(),
            bias: rows.iter().map(|(_, _, b)| *b).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_is_valid() {
        assert!(ModelWeights::builtin().validate().is_ok());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut w = ModelWeights::builtin();
        w.weights[2].pop();
        assert!(matches!(w.validate(), Err(RolewatchError::Config(_))));

        let mut w = ModelWeights::builtin();
        w.bias.pop();
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(ModelWeights::load("/nonexistent.json"), Err(RolewatchError::Io(_))));
    }
}
