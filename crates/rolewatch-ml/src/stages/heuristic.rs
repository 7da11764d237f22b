//! Rule stage: well-known service ports and payload signatures

use crate::{Candidate, FlowFeatures, Stage};
use rolewatch_common::{Label, RolewatchResult};

/// Fast rule-based stage
pub struct PortHeuristicStage {
    /// (port, label, confidence)
    port_rules: Vec<(u16, &'static str, f32)>,
    /// (signature, label, confidence), checked before ports
    signatures: Vec<(&'static [u8], &'static str, f32)>,
}

impl PortHeuristicStage {
    /// Create stage with the built-in rule tables
    pub fn new() -> Self {
        Self {
            port_rules: vec![
                (515, "printer", 0.85),   // LPD
                (631, "printer", 0.8),    // IPP
                (9100, "printer", 0.85),  // JetDirect
                (554, "camera", 0.8),     // RTSP
                (8554, "camera", 0.75),
                (37777, "camera", 0.75),  // DVR
                (5060, "voip-phone", 0.8),
                (5061, "voip-phone", 0.8),
                (22, "server", 0.6),
                (3389, "workstation", 0.6),
                (1883, "iot", 0.7),       // MQTT
                (8883, "iot", 0.7),
                (5683, "iot", 0.7),       // CoAP
            ],
            signatures: vec![
                (&b"@PJL"[..], "printer", 0.95),
                (&b"%!PS"[..], "printer", 0.9),
                (&b"RTSP/1.0"[..], "camera", 0.9),
                (&b"SIP/2.0"[..], "voip-phone", 0.9),
                (&b"SSH-2.0"[..], "server", 0.6),
                (&b"M-SEARCH"[..], "iot", 0.6),
            ],
        }
    }

    fn match_signature(&self, payload: &[u8]) -> Option<(&'static str, f32)> {
        self.signatures
            .iter()
            .find(|(sig, _, _)| payload.windows(sig.len()).any(|w| w == *sig))
            .map(|(_, label, conf)| (*label, *conf))
    }

    fn match_port(&self, port: u16) -> Option<(&'static str, f32)> {
        self.port_rules
            .iter()
            .find(|(p, _, _)| *p == port)
            .map(|(_, label, conf)| (*label, *conf))
    }
}

impl Default for PortHeuristicStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for PortHeuristicStage {
    fn name(&self) -> &'static str { "port-heuristic" }

    fn classify(&self, features: &FlowFeatures, _earlier: &[Candidate]) -> RolewatchResult<Option<Candidate>> {
        let hit = self
            .match_signature(&features.payload)
            .or_else(|| features.service_port.and_then(|p| self.match_port(p)));

        Ok(hit.map(|(label, confidence)| {
            Candidate::new(Label::new(label), confidence, self.name(), features.observed_at)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use rolewatch_common::{FlowTuple, Observation};

    fn features(dst_port: Option<u16>, payload: &[u8]) -> FlowFeatures {
        extract(&Observation {
            identity: Some("aa:bb:cc:dd:ee:ff".into()),
            timestamp: Some(1000.0),
            flow: Some(FlowTuple { dst_port, protocol: Some(6), ..Default::default() }),
            payload: Some(hex::encode(payload)),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_port_rule() {
        let c = PortHeuristicStage::new().classify(&features(Some(9100), b""), &[]).unwrap().unwrap();
        assert_eq!(c.label, Label::new("printer"));
        assert_eq!(c.stage, "port-heuristic");
    }

    #[test]
    fn test_signature_beats_port() {
        let c = PortHeuristicStage::new()
            .classify(&features(Some(9100), b"DESCRIBE x RTSP/1.0\r\n"), &[])
            .unwrap()
            .unwrap();
        assert_eq!(c.label, Label::new("camera"));
    }

    #[test]
    fn test_abstains_without_evidence() {
        let c = PortHeuristicStage::new().classify(&features(Some(12345), b"hello"), &[]).unwrap();
        assert!(c.is_none());
    }
}
