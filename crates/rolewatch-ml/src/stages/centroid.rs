//! Nearest-centroid stage

use crate::{Candidate, FlowFeatures, Stage, FEATURE_DIM};
use rolewatch_common::{Label, RolewatchResult};

/// Minimum recovered-field fraction for a meaningful similarity
const MIN_COMPLETENESS: f32 = 0.3;
/// Confidence added per earlier stage agreeing with the best centroid
const AGREEMENT_BONUS: f32 = 0.1;

/// Cosine similarity against per-label centroid vectors
pub struct CentroidStage {
    centroids: Vec<(Label, Vec<f32>)>,
    min_similarity: f32,
}

impl CentroidStage {
    /// Create stage from centroids
    pub fn new(centroids: Vec<(Label, Vec<f32>)>, min_similarity: f32) -> Self {
        Self {
            centroids,
            min_similarity,
        }
    }

    /// Built-in centroids
    pub fn builtin(min_similarity: f32) -> Self {
        //                  bytes pkts mean tcp  udp  oth  <1k  prn  strm adm  sip  disc ent  prnt rate cmpl
        let table: [(&str, [f32; FEATURE_DIM]); 6] = [
            ("workstation", [0.5, 0.3, 0.4, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.9, 0.2, 0.5, 1.0]),
            ("printer", [0.5, 0.25, 0.6, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.9, 0.4, 1.0]),
            ("camera", [0.8, 0.6, 0.9, 0.5, 0.5, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.9, 0.1, 0.8, 1.0]),
            ("server", [0.6, 0.4, 0.5, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.8, 0.5, 0.5, 1.0]),
            ("voip-phone", [0.3, 0.4, 0.15, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.4, 0.9, 0.3, 1.0]),
            ("iot", [0.2, 0.15, 0.1, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.4, 0.6, 0.2, 1.0]),
        ];
        Self::new(
            table.iter().map(|(l, c)| (Label::new(l), c.to_vec())).collect(),
            min_similarity,
        )
    }
}

impl Stage for CentroidStage {
    fn name(&self) -> &'static str { "centroid-model" }

    fn classify(&self, features: &FlowFeatures, earlier: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
        if features.completeness < MIN_COMPLETENESS {
            return Ok(None);
        }

        let mut scored: Vec<(&Label, f32)> = self
            .centroids
            .iter()
            .map(|(label, centroid)| (label, features.vector.cosine_similarity(centroid)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let (label, best) = match scored.first() {
            Some(top) if top.1 >= self.min_similarity => *top,
            _ => return Ok(None),
        };
        let second = scored.get(1).map(|s| s.1).unwrap_or(0.0);

        let agreeing = earlier.iter().filter(|c| &c.label == label).count() as f32;
        let confidence = 0.5 * best + 0.5 * (best - second).max(0.0) + AGREEMENT_BONUS * agreeing;

        Ok(Some(Candidate::new(label.clone(), confidence, self.name(), features.observed_at)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use rolewatch_common::{FlowTuple, Observation};

    fn print_features() -> FlowFeatures {
        extract(&Observation {
            identity: Some("aa:bb:cc:dd:ee:ff".into()),
            timestamp: Some(1000.0),
            flow: Some(FlowTuple { dst_port: Some(9100), protocol: Some(6), ..Default::default() }),
            bytes: Some(45_000),
            packets: Some(50),
            duration: Some(3.0),
            payload: Some(hex::encode(b"@PJL JOB NAME=\"report\"\r\n")),
            source: Some("sw1/3".into()),
        })
        .unwrap()
    }

    #[test]
    fn test_nearest_centroid() {
        let c = CentroidStage::builtin(0.6).classify(&print_features(), &[]).unwrap().unwrap();
        assert_eq!(c.label, Label::new("printer"));
    }

    #[test]
    fn test_agreement_bonus() {
        let stage = CentroidStage::builtin(0.6);
        let f = print_features();
        let alone = stage.classify(&f, &[]).unwrap().unwrap();
        let earlier = vec![Candidate::new(Label::new("printer"), 0.9, "port-heuristic", f.observed_at)];
        let agreed = stage.classify(&f, &earlier).unwrap().unwrap();
        assert!(agreed.confidence > alone.confidence || agreed.confidence == 1.0);
    }

    #[test]
    fn test_sparse_observation_abstains() {
        let f = extract(&Observation {
            identity: Some("aa:bb:cc:dd:ee:ff".into()),
            timestamp: Some(1000.0),
            ..Default::default()
        })
        .unwrap();
        assert!(CentroidStage::builtin(0.6).classify(&f, &[]).unwrap().is_none());
    }
}
