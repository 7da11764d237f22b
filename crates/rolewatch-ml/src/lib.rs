//! Feature extraction and multi-stage role classification
//!
//! # Pipeline
//!
//! ```text
//! Observation ──► extract() ──► FlowFeatures ──► StageChain::classify() ──► Verdict
//!                                                  │
//!                                                  ├─ port-heuristic  (rules)
//!                                                  ├─ linear-model    (softmax)
//!                                                  └─ centroid-model  (cosine)
//! ```
//!
//! Extraction and classification are pure and CPU-bound; they never touch
//! device state and run outside any store lock.

#![warn(missing_docs)]

pub mod candidate;
pub mod extract;
pub mod features;
pub mod model;
pub mod stage;
pub mod stages;

pub use candidate::{Candidate, Verdict};
pub use extract::{extract, FlowFeatures};
pub use features::FeatureVector;
pub use model::ModelWeights;
pub use stage::{Stage, StageChain};

use serde::{Deserialize, Serialize};

/// Dimension of the extracted feature vector
pub const FEATURE_DIM: usize = 16;

/// Classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Model weights path (JSON); built-in weights when absent
    pub model_path: Option<String>,
    /// Minimum packets before model stages will vote
    pub min_packets: u64,
    /// Weight of earlier-stage candidates fed into the linear model
    pub prior_weight: f32,
    /// Minimum cosine similarity for the centroid stage to vote
    pub min_similarity: f32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            min_packets: 3,
            prior_weight: 1.5,
            min_similarity: 0.6,
        }
    }
}
