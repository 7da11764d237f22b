//! Engine Statistics
//!
//! Lock-free counters, mirrored into the `metrics` facade so an embedding
//! process can attach any recorder.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Messages received from the broker
    pub received: AtomicU64,
    /// Observations merged
    pub merged: AtomicU64,
    /// Redelivered observations recognised as duplicates
    pub duplicates: AtomicU64,
    /// Same-timestamp observations with different content
    pub conflicts: AtomicU64,
    /// Dropped malformed messages
    pub malformed: AtomicU64,
    /// Messages left for redelivery
    pub nacked: AtomicU64,
    /// Transitions with side effects
    pub transitions: AtomicU64,
    /// Operator actions applied
    pub actions: AtomicU64,
    /// Enforcement commands sent (attempts)
    pub enforcement_sent: AtomicU64,
    /// Commands applied by the controller
    pub enforcement_applied: AtomicU64,
    /// Commands rejected by the controller
    pub enforcement_failed: AtomicU64,
    /// Retried attempts
    pub enforcement_retries: AtomicU64,
    /// Delivery cycles that ran out of attempts
    pub enforcement_exhausted: AtomicU64,
    /// Records evicted
    pub evictions: AtomicU64,
    /// Completed sweeps
    pub sweeps: AtomicU64,
}

macro_rules! recorder {
    ($fn:ident, $field:ident, $metric:literal) => {
        #[inline]
        #[doc = concat!("Count one `", stringify!($field), "` event")]
        pub fn $fn(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            metrics::counter!($metric).increment(1);
        }
    };
}

impl EngineStats {
    recorder!(record_received, received, "rolewatch_messages_received_total");
    recorder!(record_merged, merged, "rolewatch_observations_merged_total");
    recorder!(record_duplicate, duplicates, "rolewatch_duplicate_observations_total");
    recorder!(record_conflict, conflicts, "rolewatch_merge_conflicts_seen_total");
    recorder!(record_malformed, malformed, "rolewatch_malformed_observations_total");
    recorder!(record_nack, nacked, "rolewatch_messages_nacked_total");
    recorder!(record_transition, transitions, "rolewatch_transitions_total");
    recorder!(record_action, actions, "rolewatch_operator_actions_total");
    recorder!(record_enforcement_sent, enforcement_sent, "rolewatch_enforcement_sent_total");
    recorder!(record_enforcement_applied, enforcement_applied, "rolewatch_enforcement_applied_total");
    recorder!(record_enforcement_failed, enforcement_failed, "rolewatch_enforcement_failed_total");
    recorder!(record_enforcement_retry, enforcement_retries, "rolewatch_enforcement_retries_total");
    recorder!(record_enforcement_exhausted, enforcement_exhausted, "rolewatch_enforcement_exhausted_total");
    recorder!(record_sweep, sweeps, "rolewatch_sweeps_total");

    /// Count evictions
    pub fn record_evictions(&self, n: u64) {
        self.evictions.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("rolewatch_evictions_total").increment(n);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            transitions: self.transitions.load(Ordering::Relaxed),
            actions: self.actions.load(Ordering::Relaxed),
            enforcement_sent: self.enforcement_sent.load(Ordering::Relaxed),
            enforcement_applied: self.enforcement_applied.load(Ordering::Relaxed),
            enforcement_failed: self.enforcement_failed.load(Ordering::Relaxed),
            enforcement_retries: self.enforcement_retries.load(Ordering::Relaxed),
            enforcement_exhausted: self.enforcement_exhausted.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            sweeps: self.sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatsSnapshot {
    pub received: u64,
    pub merged: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub malformed: u64,
    pub nacked: u64,
    pub transitions: u64,
    pub actions: u64,
    pub enforcement_sent: u64,
    pub enforcement_applied: u64,
    pub enforcement_failed: u64,
    pub enforcement_retries: u64,
    pub enforcement_exhausted: u64,
    pub evictions: u64,
    pub sweeps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = EngineStats::default();
        stats.record_received();
        stats.record_received();
        stats.record_duplicate();
        stats.record_evictions(3);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.evictions, 3);
        assert_eq!(snap.merged, 0);
    }
}
