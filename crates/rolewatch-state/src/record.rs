//! Device Record
//!
//! The durable per-device state. Owned by the store, mutated only by the
//! coordinator while the owning shard is locked.

use crate::decay::decayed_at;
use rolewatch_common::{DeviceId, Label, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// No label yet
    New,
    /// Collecting consistent candidates
    Provisional,
    /// Label confirmed (and enforced)
    Confirmed,
    /// Confirmed label challenged, vote in progress
    Contested,
    /// Confirmed label decayed below the low watermark
    Stale,
    /// Removed from the store (reported only, never stored)
    Evicted,
}

impl DeviceState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::New => "new",
            DeviceState::Provisional => "provisional",
            DeviceState::Confirmed => "confirmed",
            DeviceState::Contested => "contested",
            DeviceState::Stale => "stale",
            DeviceState::Evicted => "evicted",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Enforcement status of a record's confirmed label
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum EnforcementStatus {
    /// Nothing enforced yet
    #[default]
    Idle,
    /// Command issued, controller has not acknowledged
    Pending {
        /// Target label
        label: Label,
    },
    /// Controller accepted the command
    Applied {
        /// Enforced label
        label: Label,
    },
    /// Controller rejected the command
    Failed {
        /// Rejected label
        label: Label,
        /// Controller's reason
        reason: String,
    },
}

impl EnforcementStatus {
    /// Label the controller has been (or is being) told about
    pub fn target(&self) -> Option<&Label> {
        match self {
            EnforcementStatus::Idle => None,
            EnforcementStatus::Pending { label }
            | EnforcementStatus::Applied { label }
            | EnforcementStatus::Failed { label, .. } => Some(label),
        }
    }

    /// Whether a command is outstanding
    pub fn is_pending(&self) -> bool {
        matches!(self, EnforcementStatus::Pending { .. })
    }
}

/// What a history entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Routine observation, no state change
    Observation,
    /// Every stage abstained
    Abstain,
    /// Provisional label set or reinforced
    Provisional,
    /// Label confirmed
    Confirmed,
    /// Confirmed label challenged
    Contested,
    /// Contest vote counted
    ContestResolved,
    /// Confidence decayed below the low watermark
    Stale,
}

/// One bounded-history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Observation (or sweep) time
    pub at: Timestamp,
    /// Label
    pub label: Label,
    /// Confidence
    pub confidence: f32,
    /// Entry kind
    pub kind: HistoryKind,
    /// Classifier stages that agreed with the label
    pub agreement: u8,
}

/// Bounded, timestamp-ordered history
///
/// Out-of-order entries are inserted at their timestamp position. When full,
/// the oldest entry is dropped; an entry older than everything in a full
/// history is discarded instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct History {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl History {
    /// Create with capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    /// Insert an entry
    pub fn push(&mut self, entry: HistoryEntry) {
        let full = self.entries.len() >= self.capacity;
        if full && self.entries.front().map_or(false, |oldest| entry.at < oldest.at) {
            return;
        }

        let pos = self.entries.partition_point(|e| e.at <= entry.at);
        self.entries.insert(pos, entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent entry
    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    /// Entries oldest first
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}

/// One vote cast during a contest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Voted label
    pub label: Label,
    /// Vote weight
    pub confidence: f32,
    /// Observation time
    pub at: Timestamp,
}

/// An open contest against a confirmed label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contest {
    /// Time the contest opened
    pub started: Timestamp,
    /// Label confirmed when the contest opened
    pub incumbent: Label,
    /// Votes so far (the incumbent's decayed confidence is the first)
    pub votes: Vec<Vote>,
}

/// Durable per-device state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device identity
    pub identity: DeviceId,
    /// Lifecycle state
    pub state: DeviceState,
    /// Current label
    pub label: Label,
    /// Stored confidence (decays from `confidence_at`)
    pub confidence: f32,
    /// When `confidence` was stored
    pub confidence_at: Timestamp,
    /// Newest observation timestamp
    pub last_observed: Timestamp,
    /// Bounded label history
    pub history: History,
    /// Provisional confirmation window: (observed_at, confidence)
    pub window: Vec<(Timestamp, f32)>,
    /// Open contest, if any
    pub contest: Option<Contest>,
    /// Enforcement status
    pub enforcement: EnforcementStatus,
    /// Recently merged observations: timestamp -> content fingerprint
    #[serde(with = "seen_serde")]
    pub seen: BTreeMap<Timestamp, u64>,
    /// Tracked but never enforced
    pub ignored: bool,
    /// Operator asked for removal; the next sweep evicts it
    pub remove_requested: bool,
}

impl DeviceRecord {
    /// Fresh record: label unknown, confidence zero
    pub fn new(identity: DeviceId, now: Timestamp, history_len: usize) -> Self {
        Self {
            identity,
            state: DeviceState::New,
            label: Label::unknown(),
            confidence: 0.0,
            confidence_at: now,
            last_observed: now,
            history: History::new(history_len),
            window: Vec::new(),
            contest: None,
            enforcement: EnforcementStatus::Idle,
            seen: BTreeMap::new(),
            ignored: false,
            remove_requested: false,
        }
    }

    /// Confidence decayed to `now`
    #[inline]
    pub fn confidence_at(&self, now: Timestamp, lambda: f64) -> f32 {
        decayed_at(self.confidence, self.confidence_at, now, lambda)
    }

    /// Store a new confidence value observed at `at`
    pub(crate) fn set_confidence(&mut self, confidence: f32, at: Timestamp) {
        self.confidence = confidence.clamp(0.0, 1.0);
        self.confidence_at = self.confidence_at.max(at);
    }

    /// Append a history entry for the current label
    pub(crate) fn record(&mut self, kind: HistoryKind, at: Timestamp, agreement: u8) {
        self.history.push(HistoryEntry {
            at,
            label: self.label.clone(),
            confidence: self.confidence,
            kind,
            agreement,
        });
    }

    /// Read-only view for reporting
    pub fn snapshot(&self, now: Timestamp, lambda: f64) -> DeviceSnapshot {
        DeviceSnapshot {
            identity: self.identity.clone(),
            label: self.label.clone(),
            confidence: self.confidence_at(now, lambda),
            state: self.state,
            last_observed: self.last_observed,
            enforcement: self.enforcement.clone(),
            ignored: self.ignored,
            history: self.history.iter().cloned().collect(),
        }
    }
}

/// Reporting view of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Device identity
    pub identity: DeviceId,
    /// Current label
    pub label: Label,
    /// Confidence decayed to snapshot time
    pub confidence: f32,
    /// Lifecycle state
    pub state: DeviceState,
    /// Newest observation timestamp
    pub last_observed: Timestamp,
    /// Enforcement status
    pub enforcement: EnforcementStatus,
    /// Whether enforcement is suppressed
    pub ignored: bool,
    /// Bounded history, oldest first
    pub history: Vec<HistoryEntry>,
}

/// JSON object keys must be strings; the seen set is written as pairs
mod seen_serde {
    use rolewatch_common::Timestamp;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(seen: &BTreeMap<Timestamp, u64>, s: S) -> Result<S::Ok, S::Error> {
        let pairs: Vec<(Timestamp, u64)> = seen.iter().map(|(k, v)| (*k, *v)).collect();
        pairs.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<Timestamp, u64>, D::Error> {
        let pairs: Vec<(Timestamp, u64)> = Vec::deserialize(d)?;
        Ok(pairs.into_iter().collect())
    }
}
