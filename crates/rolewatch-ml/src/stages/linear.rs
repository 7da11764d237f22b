//! Softmax model stage

use crate::{Candidate, FlowFeatures, ModelWeights, Stage};
use rolewatch_common::{Label, RolewatchError, RolewatchResult};
use std::sync::Arc;

/// Linear softmax classifier over the feature vector
///
/// Earlier candidates are added to their label's logit, scaled by
/// confidence and `prior_weight`.
pub struct LinearModelStage {
    weights: Option<Arc<ModelWeights>>,
    min_packets: u64,
    prior_weight: f32,
}

impl LinearModelStage {
    /// Create stage; `None` weights make every call unavailable
    pub fn new(weights: Option<Arc<ModelWeights>>, min_packets: u64, prior_weight: f32) -> Self {
        Self {
            weights,
            min_packets,
            prior_weight,
        }
    }
}

impl Stage for LinearModelStage {
    fn name(&self) -> &'static str { "linear-model" }

    fn classify(&self, features: &FlowFeatures, earlier: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
        let model = self.weights.as_ref().ok_or_else(|| RolewatchError::ClassifierUnavailable {
            stage: self.name().into(),
            reason: "model weights not loaded".into(),
        })?;

        if features.packets < self.min_packets {
            return Ok(None);
        }

        let logits: Vec<f32> = model
            .labels
            .iter()
            .zip(model.weights.iter().zip(model.bias.iter()))
            .map(|(label, (row, bias))| {
                let prior: f32 = earlier
                    .iter()
                    .filter(|c| c.label.as_str() == label)
                    .map(|c| c.confidence * self.prior_weight)
                    .sum();
                features.vector.dot(row) + bias + prior
            })
            .collect();

        let max = logits.iter().copied().fold(f32::MIN, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        if total <= 0.0 || !total.is_finite() {
            return Ok(None);
        }

        let (best, p) = exps
            .iter()
            .enumerate()
            .fold((0, 0.0f32), |(bi, bp), (i, e)| {
                let p = e / total;
                if p > bp { (i, p) } else { (bi, bp) }
            });

        Ok(Some(Candidate::new(
            Label::new(&model.labels[best]),
            p,
            self.name(),
            features.observed_at,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use rolewatch_common::{FlowTuple, Observation};

    fn features(dst_port: u16, packets: u64) -> FlowFeatures {
        extract(&Observation {
            identity: Some("aa:bb:cc:dd:ee:ff".into()),
            timestamp: Some(1000.0),
            flow: Some(FlowTuple { dst_port: Some(dst_port), protocol: Some(6), ..Default::default() }),
            bytes: Some(packets * 900),
            packets: Some(packets),
            payload: Some(hex::encode(b"@PJL ENTER LANGUAGE=PCL")),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_builtin_model_recognizes_print_traffic() {
        let stage = LinearModelStage::new(Some(Arc::new(ModelWeights::builtin())), 3, 1.5);
        let c = stage.classify(&features(9100, 40), &[]).unwrap().unwrap();
        assert_eq!(c.label, Label::new("printer"));
        assert!(c.confidence > 0.5);
    }

    #[test]
    fn test_prior_raises_confidence() {
        let stage = LinearModelStage::new(Some(Arc::new(ModelWeights::builtin())), 3, 1.5);
        let f = features(9100, 40);
        let alone = stage.classify(&f, &[]).unwrap().unwrap();
        let prior = Candidate::new(Label::new("printer"), 0.9, "port-heuristic", f.observed_at);
        let boosted = stage.classify(&f, &[prior]).unwrap().unwrap();
        assert!(boosted.confidence > alone.confidence);
    }

    #[test]
    fn test_low_volume_abstains() {
        let stage = LinearModelStage::new(Some(Arc::new(ModelWeights::builtin())), 3, 1.5);
        assert!(stage.classify(&features(9100, 1), &[]).unwrap().is_none());
    }

    #[test]
    fn test_missing_weights_is_unavailable() {
        let stage = LinearModelStage::new(None, 3, 1.5);
        assert!(matches!(
            stage.classify(&features(9100, 40), &[]),
            Err(RolewatchError::ClassifierUnavailable { .. })
        ));
    }
}
