//! Sharded Device State Store
//!
//! Identities are partitioned across a fixed array of shards
//! (`stable_hash(identity) % shard_count`), each behind its own mutex. The
//! lock count is independent of the device population, and a shard lock is
//! held only for one record's merge or one shard's sweep/copy.

use crate::coordinator::{Coordinator, Transition};
use crate::record::{DeviceRecord, DeviceSnapshot, DeviceState, EnforcementStatus};
use crate::CoordinatorPolicy;
use parking_lot::{Mutex, RwLock};
use rolewatch_common::{DeviceId, Label, RolewatchError, RolewatchResult, Timestamp};
use rolewatch_ml::Verdict;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

type Shard = HashMap<DeviceId, DeviceRecord>;

/// Result of sweeping one or more shards
#[derive(Debug, Default)]
pub struct SweepReport {
    /// State changes made by the sweep (stale, contest resolved)
    pub transitions: Vec<Transition>,
    /// Eviction transitions, one per removed record
    pub evicted: Vec<Transition>,
}

impl SweepReport {
    fn extend(&mut self, other: SweepReport) {
        self.transitions.extend(other.transitions);
        self.evicted.extend(other.evicted);
    }

    /// Identities removed by the sweep
    pub fn evicted_identities(&self) -> Vec<DeviceId> {
        self.evicted.iter().map(|t| t.identity.clone()).collect()
    }
}

/// Controller answer for a pending command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementResult {
    /// Command accepted
    Applied,
    /// Command rejected
    Rejected(String),
}

/// Concurrency-safe identity -> record map
pub struct DeviceStore {
    shards: Box<[Mutex<Shard>]>,
    coordinator: Coordinator,
    ignored: RwLock<HashSet<DeviceId>>,
    len: AtomicUsize,
    max_devices: usize,
}

impl DeviceStore {
    /// Create store with `shard_count` shards
    pub fn new(policy: CoordinatorPolicy, shard_count: usize, max_devices: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            coordinator: Coordinator::new(policy),
            ignored: RwLock::new(HashSet::new()),
            len: AtomicUsize::new(0),
            max_devices,
        }
    }

    /// Number of shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Policy in effect
    pub fn policy(&self) -> &CoordinatorPolicy {
        self.coordinator.policy()
    }

    #[inline]
    fn shard_index(&self, identity: &DeviceId) -> usize {
        (identity.stable_hash() % self.shards.len() as u64) as usize
    }

    fn new_record(&self, identity: &DeviceId, now: Timestamp) -> DeviceRecord {
        let mut record = DeviceRecord::new(identity.clone(), now, self.policy().history_len);
        record.ignored = self.ignored.read().contains(identity);
        record
    }

    fn entry<'a>(&self, shard: &'a mut Shard, identity: &DeviceId, now: Timestamp) -> RolewatchResult<&'a mut DeviceRecord> {
        if !shard.contains_key(identity) {
            if self.len() >= self.max_devices {
                return Err(RolewatchError::StoreUnavailable(format!(
                    "device limit {} reached",
                    self.max_devices
                )));
            }
            shard.insert(identity.clone(), self.new_record(identity, now));
            self.len.fetch_add(1, Ordering::Relaxed);
        }
        shard
            .get_mut(identity)
            .ok_or_else(|| RolewatchError::StoreUnavailable(format!("record {} vanished", identity)))
    }

    /// Get a record's snapshot, creating a NEW record if absent
    pub fn get_or_create(&self, identity: &DeviceId, now: Timestamp) -> RolewatchResult<DeviceSnapshot> {
        let mut shard = self.shards[self.shard_index(identity)].lock();
        let record = self.entry(&mut shard, identity, now)?;
        Ok(record.snapshot(now, self.policy().decay_lambda))
    }

    /// Snapshot of one record
    pub fn get(&self, identity: &DeviceId, now: Timestamp) -> Option<DeviceSnapshot> {
        let shard = self.shards[self.shard_index(identity)].lock();
        shard.get(identity).map(|r| r.snapshot(now, self.policy().decay_lambda))
    }

    /// Copy of one full record
    pub fn record(&self, identity: &DeviceId) -> Option<DeviceRecord> {
        self.shards[self.shard_index(identity)].lock().get(identity).cloned()
    }

    /// Merge a verdict under the identity's shard lock
    pub fn merge(&self, verdict: &Verdict) -> RolewatchResult<Transition> {
        let mut shard = self.shards[self.shard_index(&verdict.identity)].lock();
        let record = self.entry(&mut shard, &verdict.identity, verdict.observed_at)?;
        Ok(self.coordinator.merge(record, verdict))
    }

    /// Sweep every shard
    pub fn sweep(&self, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();
        for idx in 0..self.shards.len() {
            report.extend(self.sweep_shard(idx, now));
        }
        report
    }

    /// Sweep one shard: decay, settle contests, evict
    ///
    /// Each record is read and conditionally removed on its own, so stopping
    /// between shards leaves every record consistent.
    pub fn sweep_shard(&self, idx: usize, now: Timestamp) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(shard) = self.shards.get(idx) else {
            return report;
        };
        let mut shard = shard.lock();

        shard.retain(|_, record| {
            let decision = self.coordinator.sweep(record, now);
            if let Some(t) = decision.transition {
                report.transitions.push(t);
            }
            if decision.evict {
                report.evicted.push(Transition::evicted(record, now));
            }
            !decision.evict
        });
        self.len.fetch_sub(report.evicted.len(), Ordering::Relaxed);
        report
    }

    /// Consistent per-shard copy of every record
    pub fn snapshot(&self, now: Timestamp) -> Vec<DeviceSnapshot> {
        let lambda = self.policy().decay_lambda;
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            let records: Vec<DeviceRecord> = shard.lock().values().cloned().collect();
            out.extend(records.iter().map(|r| r.snapshot(now, lambda)));
        }
        out
    }

    /// Record count per state
    pub fn state_counts(&self) -> HashMap<DeviceState, usize> {
        let mut counts = HashMap::new();
        for shard in self.shards.iter() {
            for record in shard.lock().values() {
                *counts.entry(record.state).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Commands still awaiting a controller answer
    pub fn pending_enforcements(&self) -> Vec<(DeviceId, Label)> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            for record in shard.lock().values() {
                if let EnforcementStatus::Pending { label } = &record.enforcement {
                    out.push((record.identity.clone(), label.clone()));
                }
            }
        }
        out
    }

    /// Whether `identity` still awaits enforcement of exactly `label`
    pub fn is_enforcement_pending(&self, identity: &DeviceId, label: &Label) -> bool {
        let shard = self.shards[self.shard_index(identity)].lock();
        matches!(
            shard.get(identity).map(|r| &r.enforcement),
            Some(EnforcementStatus::Pending { label: pending }) if pending == label
        )
    }

    /// Mark a confirmed record's label pending again, whatever the last
    /// controller answer was. Returns the label to enforce; `None` for
    /// unknown, unconfirmed or ignored records.
    pub fn reenforce(&self, identity: &DeviceId) -> Option<Label> {
        let mut shard = self.shards[self.shard_index(identity)].lock();
        let record = shard.get_mut(identity)?;
        if record.state != DeviceState::Confirmed || record.ignored {
            return None;
        }
        record.enforcement = EnforcementStatus::Pending { label: record.label.clone() };
        Some(record.label.clone())
    }

    /// Record the controller's answer
    ///
    /// Ignored unless the record is still pending for the same label, so a
    /// late answer for a superseded label cannot overwrite newer state.
    pub fn settle_enforcement(&self, identity: &DeviceId, label: &Label, result: EnforcementResult) -> bool {
        let mut shard = self.shards[self.shard_index(identity)].lock();
        let Some(record) = shard.get_mut(identity) else {
            return false;
        };
        match &record.enforcement {
            EnforcementStatus::Pending { label: pending } if pending == label => {}
            _ => return false,
        }

        record.enforcement = match result {
            EnforcementResult::Applied => EnforcementStatus::Applied { label: label.clone() },
            EnforcementResult::Rejected(reason) => EnforcementStatus::Failed { label: label.clone(), reason },
        };
        true
    }

    /// Track an identity without ever enforcing it
    pub fn ignore(&self, identity: &DeviceId) {
        self.ignored.write().insert(identity.clone());
        if let Some(record) = self.shards[self.shard_index(identity)].lock().get_mut(identity) {
            record.ignored = true;
        }
    }

    /// Resume enforcement for every ignored identity
    pub fn clear_ignored(&self) -> usize {
        let cleared: Vec<DeviceId> = self.ignored.write().drain().collect();
        for identity in &cleared {
            if let Some(record) = self.shards[self.shard_index(identity)].lock().get_mut(identity) {
                record.ignored = false;
            }
        }
        cleared.len()
    }

    /// Whether an identity is ignored
    pub fn is_ignored(&self, identity: &DeviceId) -> bool {
        self.ignored.read().contains(identity)
    }

    /// Ignored identities
    pub fn ignored(&self) -> Vec<DeviceId> {
        self.ignored.read().iter().cloned().collect()
    }

    /// Flag a record for removal by the next sweep
    pub fn flag_remove(&self, identity: &DeviceId) -> bool {
        match self.shards[self.shard_index(identity)].lock().get_mut(identity) {
            Some(record) => {
                record.remove_requested = true;
                true
            }
            None => false,
        }
    }

    /// Flag every record matching `pred` for removal
    pub fn flag_remove_where(&self, pred: impl Fn(&DeviceRecord) -> bool) -> usize {
        let mut flagged = 0;
        for shard in self.shards.iter() {
            for record in shard.lock().values_mut() {
                if pred(record) {
                    record.remove_requested = true;
                    flagged += 1;
                }
            }
        }
        flagged
    }

    /// Copy of every record (checkpointing)
    pub fn export(&self) -> Vec<DeviceRecord> {
        let mut out = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            out.extend(shard.lock().values().cloned());
        }
        out
    }

    /// Load records and ignored identities, replacing existing entries
    pub fn restore(&self, records: Vec<DeviceRecord>, ignored: Vec<DeviceId>) {
        self.ignored.write().extend(ignored);
        for record in records {
            let mut shard = self.shards[self.shard_index(&record.identity)].lock();
            if shard.insert(record.identity.clone(), record).is_none() {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
