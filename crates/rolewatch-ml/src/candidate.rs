//! Classification candidates and per-observation verdicts

use rolewatch_common::{DeviceId, Label, Timestamp};

/// One stage's output for one observation
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Role label
    pub label: Label,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Producing stage
    pub stage: &'static str,
    /// Observation timestamp
    pub observed_at: Timestamp,
}

impl Candidate {
    /// Create a candidate, clamping confidence into [0, 1]
    pub fn new(label: Label, confidence: f32, stage: &'static str, observed_at: Timestamp) -> Self {
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            label,
            confidence,
            stage,
            observed_at,
        }
    }
}

/// All candidates the chain produced for one observation
#[derive(Debug, Clone)]
pub struct Verdict {
    /// Device identity
    pub identity: DeviceId,
    /// Observation timestamp
    pub observed_at: Timestamp,
    /// Observation content fingerprint
    pub fingerprint: u64,
    /// Candidates in stage order (abstaining stages are absent)
    pub candidates: Vec<Candidate>,
    /// Stages that failed and were treated as abstaining
    pub degraded: Vec<&'static str>,
}

impl Verdict {
    /// Candidate the coordinator acts on: highest confidence, ties to the
    /// later stage
    pub fn decisive(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .fold(None, |best: Option<&Candidate>, c| match best {
                Some(b) if b.confidence > c.confidence => Some(b),
                _ => Some(c),
            })
    }

    /// Number of stages that voted for `label`
    pub fn agreement(&self, label: &Label) -> usize {
        self.candidates.iter().filter(|c| &c.label == label).count()
    }

    /// Whether every stage abstained
    pub fn is_abstain(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(candidates: Vec<Candidate>) -> Verdict {
        Verdict {
            identity: DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap(),
            observed_at: Timestamp::from_secs(10),
            fingerprint: 0,
            candidates,
            degraded: Vec::new(),
        }
    }

    #[test]
    fn test_decisive_prefers_confidence_then_later_stage() {
        let ts = Timestamp::from_secs(10);
        let v = verdict(vec![
            Candidate::new("printer".into(), 0.9, "a", ts),
            Candidate::new("camera".into(), 0.7, "b", ts),
            Candidate::new("server".into(), 0.9, "c", ts),
        ]);
        assert_eq!(v.decisive().unwrap().stage, "c");
        assert_eq!(v.agreement(&"printer".into()), 1);
    }

    #[test]
    fn test_abstain() {
        let v = verdict(Vec::new());
        assert!(v.is_abstain());
        assert!(v.decisive().is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let c = Candidate::new("printer".into(), 1.7, "a", Timestamp::default());
        assert_eq!(c.confidence, 1.0);
        let c = Candidate::new("printer".into(), f32::NAN, "a", Timestamp::default());
        assert_eq!(c.confidence, 0.0);
    }
}
