//! Classifier Stage Chain
//!
//! Stages run in fixed priority order. Every applicable stage runs, even
//! after a confident early answer, so history can show agreement across
//! stages. Later stages see earlier candidates as extra input. A failing
//! stage degrades to abstain.

use crate::stages::{CentroidStage, LinearModelStage, PortHeuristicStage};
use crate::{Candidate, ClassifierConfig, FlowFeatures, ModelWeights, Verdict};
use rolewatch_common::RolewatchResult;
use std::sync::Arc;

/// Uniform classifier capability
pub trait Stage: Send + Sync {
    /// Stage name (stable, used in history and metrics)
    fn name(&self) -> &'static str;

    /// Classify one observation; `Ok(None)` means abstain
    fn classify(&self, features: &FlowFeatures, earlier: &[Candidate]) -> RolewatchResult<Option<Candidate>>;
}

/// Ordered chain of classifier stages
pub struct StageChain {
    stages: Vec<Box<dyn Stage>>,
    version: u32,
}

impl StageChain {
    /// Create empty chain
    pub fn new(version: u32) -> Self {
        Self { stages: Vec::new(), version }
    }

    /// Standard chain: port heuristic, linear model, centroid model
    ///
    /// Weights are loaded once here and shared read-only. A weights file
    /// that cannot be read leaves the linear stage unavailable rather than
    /// failing startup.
    pub fn standard(config: &ClassifierConfig) -> Self {
        let weights = match config.model_path.as_deref() {
            Some(path) => match ModelWeights::load(path) {
                Ok(w) => Some(Arc::new(w)),
                Err(e) => {
                    tracing::warn!("Model weights {} unavailable: {}", path, e);
                    None
                }
            },
            None => Some(Arc::new(ModelWeights::builtin())),
        };
        let version = weights.as_ref().map(|w| w.version).unwrap_or(0);

        let mut chain = Self::new(version);
        chain.add_stage(Box::new(PortHeuristicStage::new()));
        chain.add_stage(Box::new(LinearModelStage::new(
            weights,
            config.min_packets,
            config.prior_weight,
        )));
        chain.add_stage(Box::new(CentroidStage::builtin(config.min_similarity)));
        chain
    }

    /// Append a stage
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    /// Run every stage
    pub fn classify(&self, features: &FlowFeatures) -> Verdict {
        let mut candidates: Vec<Candidate> = Vec::with_capacity(self.stages.len());
        let mut degraded = Vec::new();

        for stage in &self.stages {
            match stage.classify(features, &candidates) {
                Ok(Some(candidate)) => candidates.push(candidate),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(stage = stage.name(), "Stage degraded to abstain: {}", e);
                    metrics::counter!("rolewatch_classifier_unavailable_total", "stage" => stage.name())
                        .increment(1);
                    degraded.push(stage.name());
                }
            }
        }

        Verdict {
            identity: features.identity.clone(),
            observed_at: features.observed_at,
            fingerprint: features.fingerprint,
            candidates,
            degraded,
        }
    }

    /// Chain version (model weights version)
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of stages
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use rolewatch_common::{Label, Observation, RolewatchError};

    struct Fixed(&'static str, f32);

    impl Stage for Fixed {
        fn name(&self) -> &'static str { self.0 }

        fn classify(&self, f: &FlowFeatures, _: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
            Ok(Some(Candidate::new(Label::new(self.0), self.1, self.0, f.observed_at)))
        }
    }

    struct Broken;

    impl Stage for Broken {
        fn name(&self) -> &'static str { "broken" }

        fn classify(&self, _: &FlowFeatures, _: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
            Err(RolewatchError::ClassifierUnavailable {
                stage: "broken".into(),
                reason: "no model".into(),
            })
        }
    }

    struct SeesEarlier;

    impl Stage for SeesEarlier {
        fn name(&self) -> &'static str { "sees-earlier" }

        fn classify(&self, f: &FlowFeatures, earlier: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
            Ok(earlier.first().map(|c| Candidate::new(c.label.clone(), 0.5, "sees-earlier", f.observed_at)))
        }
    }

    fn features() -> FlowFeatures {
        let obs = Observation {
            identity: Some("aa:bb:cc:dd:ee:ff".into()),
            timestamp: Some(100.0),
            ..Default::default()
        };
        extract(&obs).unwrap()
    }

    #[test]
    fn test_all_stages_run_and_failures_abstain() {
        let mut chain = StageChain::new(1);
        chain.add_stage(Box::new(Fixed("printer", 0.99)));
        chain.add_stage(Box::new(Broken));
        chain.add_stage(Box::new(SeesEarlier));

        let verdict = chain.classify(&features());
        assert_eq!(verdict.candidates.len(), 2);
        assert_eq!(verdict.degraded, vec!["broken"]);
        assert_eq!(verdict.candidates[1].label, Label::new("printer"));
        assert_eq!(verdict.agreement(&Label::new("printer")), 2);
    }

    #[test]
    fn test_standard_chain_with_missing_weights_still_classifies() {
        let config = ClassifierConfig {
            model_path: Some("/nonexistent/weights.json".into()),
            ..Default::default()
        };
        let chain = StageChain::standard(&config);
        assert_eq!(chain.stage_count(), 3);
        assert_eq!(chain.version(), 0);
        let _ = chain.classify(&features());
    }
}
