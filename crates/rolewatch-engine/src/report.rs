//! Reporting Sink
//!
//! Write-only channel from the engine to external readers. Publishing never
//! blocks a worker.

use rolewatch_common::{DeviceId, Label, Timestamp};
use rolewatch_state::{DeviceSnapshot, EnforcementStatus, Transition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Event published to external readers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportEvent {
    /// A merge or sweep changed a record
    Transition(Transition),
    /// Controller answer for a command
    Enforcement {
        /// Device identity
        identity: DeviceId,
        /// Target label
        label: Label,
        /// Resulting status
        status: EnforcementStatus,
    },
    /// Periodic full snapshot
    Snapshot {
        /// Snapshot time
        at: Timestamp,
        /// Record count per state
        counts: BTreeMap<String, usize>,
        /// Every record
        devices: Vec<DeviceSnapshot>,
    },
}

/// Destination for report events
pub trait ReportingSink: Send + Sync {
    /// Publish an event (non-blocking)
    fn publish(&self, event: ReportEvent);
}

/// Fan-out to in-process subscribers
pub struct BroadcastSink {
    tx: broadcast::Sender<ReportEvent>,
}

impl BroadcastSink {
    /// Create with per-subscriber buffer `capacity`
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<ReportEvent> {
        self.tx.subscribe()
    }
}

impl ReportingSink for BroadcastSink {
    fn publish(&self, event: ReportEvent) {
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

/// Writes events to the log
#[derive(Debug, Default)]
pub struct LogSink;

impl ReportingSink for LogSink {
    fn publish(&self, event: ReportEvent) {
        match &event {
            ReportEvent::Transition(t) => {
                tracing::info!(
                    identity = %t.identity,
                    state = %t.state,
                    label = %t.label,
                    confidence = t.confidence,
                    "Device transition"
                );
            }
            ReportEvent::Enforcement { identity, label, status } => {
                tracing::info!(identity = %identity, label = %label, ?status, "Enforcement settled");
            }
            ReportEvent::Snapshot { counts, devices, .. } => {
                tracing::info!(devices = devices.len(), ?counts, "Device snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastSink::new(16);
        let mut rx = sink.subscribe();
        sink.publish(ReportEvent::Snapshot {
            at: Timestamp::from_secs(1),
            counts: BTreeMap::new(),
            devices: Vec::new(),
        });
        assert!(matches!(rx.recv().await.unwrap(), ReportEvent::Snapshot { .. }));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let sink = BroadcastSink::new(4);
        sink.publish(ReportEvent::Enforcement {
            identity: DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap(),
            label: Label::new("printer"),
            status: EnforcementStatus::Applied { label: Label::new("printer") },
        });
    }

    #[test]
    fn test_event_json_shape() {
        let event = ReportEvent::Enforcement {
            identity: DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap(),
            label: Label::new("printer"),
            status: EnforcementStatus::Failed { label: Label::new("printer"), reason: "denied".into() },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "enforcement");
        assert_eq!(json["status"]["status"], "failed");
    }
}
