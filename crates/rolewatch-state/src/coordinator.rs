//! Classification Coordinator
//!
//! Merges a classifier verdict into a device record and decides whether a
//! state transition happened.
//!
//! ```text
//!   NEW ──► PROVISIONAL ──(N within window)──► CONFIRMED ◄──(vote)── CONTESTED
//!               ▲                                 │  │                  ▲
//!               │                                 │  └──(disagreement)──┘
//!               └──────────── STALE ◄──(decay)────┘
//!                               │
//!                               └──(retention)──► EVICTED
//! ```
//!
//! All methods assume the caller holds the record's shard lock. Decay during
//! a merge is measured against observation timestamps, so replaying the same
//! observations yields the same record.

use crate::record::{Contest, DeviceRecord, DeviceState, HistoryKind, Vote};
use crate::CoordinatorPolicy;
use rolewatch_common::{DeviceId, Label, RolewatchError, Timestamp};
use rolewatch_ml::{Candidate, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a merge (or sweep) did to a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// Routine reinforcement or no-op
    None,
    /// Provisional label set or reinforced
    ProvisionalUpdate {
        /// Provisional label
        label: Label,
        /// Window mean confidence
        confidence: f32,
    },
    /// Label confirmed (possibly after a contest)
    Confirmed {
        /// Confirmed label
        label: Label,
        /// Confirmed confidence
        confidence: f32,
        /// Label replaced by this confirmation
        previous: Option<Label>,
    },
    /// A confirmed label was challenged
    Contested {
        /// Confirmed label
        incumbent: Label,
        /// Challenging label
        challenger: Label,
    },
    /// Confirmed label decayed below the low watermark
    Stale {
        /// Stale label
        label: Label,
    },
    /// Record removed
    Evicted,
}

impl TransitionOutcome {
    /// Whether downstream side effects are due
    pub fn is_change(&self) -> bool {
        !matches!(self, TransitionOutcome::None)
    }
}

/// Merge or sweep result for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Device identity
    pub identity: DeviceId,
    /// Outcome
    pub outcome: TransitionOutcome,
    /// State after the transition
    pub state: DeviceState,
    /// Label after the transition
    pub label: Label,
    /// Stored confidence after the transition
    pub confidence: f32,
    /// Observation (or sweep) time
    pub at: Timestamp,
    /// Label to enforce, when this transition requires a new command
    pub enforce: Option<Label>,
    /// The observation was already merged
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    /// A different observation had already been merged at this timestamp
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
}

impl Transition {
    fn of(record: &DeviceRecord, outcome: TransitionOutcome, at: Timestamp) -> Self {
        Self {
            identity: record.identity.clone(),
            outcome,
            state: record.state,
            label: record.label.clone(),
            confidence: record.confidence,
            at,
            enforce: None,
            duplicate: false,
            conflict: false,
        }
    }

    /// Transition reporting an eviction
    pub fn evicted(record: &DeviceRecord, at: Timestamp) -> Self {
        let mut t = Self::of(record, TransitionOutcome::Evicted, at);
        t.state = DeviceState::Evicted;
        t
    }
}

/// What a sweep decided for one record
#[derive(Debug, Clone, PartialEq)]
pub struct SweepDecision {
    /// State change performed by the sweep
    pub transition: Option<Transition>,
    /// Record should be removed
    pub evict: bool,
}

enum Seen {
    Fresh,
    Duplicate,
    Conflict,
    BeyondHorizon,
}

/// Device state machine
#[derive(Debug, Clone)]
pub struct Coordinator {
    policy: CoordinatorPolicy,
}

impl Coordinator {
    /// Create coordinator
    pub fn new(policy: CoordinatorPolicy) -> Self {
        Self { policy }
    }

    /// Policy in effect
    pub fn policy(&self) -> &CoordinatorPolicy {
        &self.policy
    }

    /// Merge one observation's verdict
    pub fn merge(&self, record: &mut DeviceRecord, verdict: &Verdict) -> Transition {
        let at = verdict.observed_at;

        let conflict = match self.check_seen(record, at, verdict.fingerprint) {
            Seen::Duplicate | Seen::BeyondHorizon => {
                let mut t = Transition::of(record, TransitionOutcome::None, at);
                t.duplicate = true;
                return t;
            }
            Seen::Conflict => {
                let err = RolewatchError::MergeConflict {
                    identity: record.identity.to_string(),
                    observed_at: at,
                };
                tracing::error!("{}; newer observation wins", err);
                metrics::counter!("rolewatch_merge_conflicts_total").increment(1);
                true
            }
            Seen::Fresh => false,
        };
        record.last_observed = record.last_observed.max(at);

        let candidate = match verdict.decisive() {
            Some(c) => c,
            None => {
                record.history.push(crate::record::HistoryEntry {
                    at,
                    label: Label::unknown(),
                    confidence: 0.0,
                    kind: HistoryKind::Abstain,
                    agreement: 0,
                });
                let mut t = Transition::of(record, TransitionOutcome::None, at);
                t.conflict = conflict;
                return t;
            }
        };
        let agreement = verdict.agreement(&candidate.label).min(u8::MAX as usize) as u8;

        let went_stale = self.expire(record, at);

        let (outcome, enforce) = match record.state {
            DeviceState::New | DeviceState::Evicted => self.merge_new(record, candidate, agreement),
            DeviceState::Provisional => self.merge_provisional(record, candidate, agreement),
            DeviceState::Confirmed => self.merge_confirmed(record, candidate, agreement),
            DeviceState::Contested => self.merge_contested(record, candidate, agreement),
            DeviceState::Stale => self.merge_stale(record, candidate, agreement),
        };

        let outcome = match outcome {
            TransitionOutcome::None if went_stale => TransitionOutcome::Stale { label: record.label.clone() },
            other => other,
        };

        let mut t = Transition::of(record, outcome, at);
        t.enforce = enforce;
        t.conflict = conflict;
        t
    }

    /// Time-driven work for one record: decay to stale, settle contests,
    /// and decide eviction
    pub fn sweep(&self, record: &mut DeviceRecord, now: Timestamp) -> SweepDecision {
        let mut transition = None;

        let settled = record
            .contest
            .as_ref()
            .map_or(false, |c| now.secs_since(c.started) >= self.policy.contest_settle_secs as f64);
        if record.state == DeviceState::Contested && settled {
            let (outcome, enforce) = self.resolve_contest(record, now);
            let mut t = Transition::of(record, outcome, now);
            t.enforce = enforce;
            transition = Some(t);
        } else if self.expire(record, now) {
            let outcome = TransitionOutcome::Stale { label: record.label.clone() };
            transition = Some(Transition::of(record, outcome, now));
        }

        let idle = now.secs_since(record.last_observed) > self.policy.retention_horizon_secs as f64;
        let evict = !record.enforcement.is_pending() && (idle || record.remove_requested);

        SweepDecision { transition, evict }
    }

    fn check_seen(&self, record: &mut DeviceRecord, at: Timestamp, fingerprint: u64) -> Seen {
        match record.seen.get(&at) {
            Some(fp) if *fp == fingerprint => return Seen::Duplicate,
            Some(_) => {
                record.seen.insert(at, fingerprint);
                return Seen::Conflict;
            }
            None => {}
        }

        // Older than every remembered observation: cannot tell a redelivery
        // from a late arrival, so it is not merged
        let full = record.seen.len() >= self.policy.dedup_len;
        if full && record.seen.keys().next().map_or(false, |oldest| at < *oldest) {
            return Seen::BeyondHorizon;
        }

        record.seen.insert(at, fingerprint);
        while record.seen.len() > self.policy.dedup_len {
            record.seen.pop_first();
        }
        Seen::Fresh
    }

    /// Move a decayed confirmed record to stale
    fn expire(&self, record: &mut DeviceRecord, at: Timestamp) -> bool {
        if record.state != DeviceState::Confirmed {
            return false;
        }
        let current = record.confidence_at(at, self.policy.decay_lambda);
        if current >= self.policy.low_watermark {
            return false;
        }
        record.state = DeviceState::Stale;
        record.set_confidence(current, at);
        record.record(HistoryKind::Stale, at, 0);
        true
    }

    fn merge_new(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        if c.confidence < self.policy.min_confidence {
            self.observe(record, c, agreement);
            return (TransitionOutcome::None, None);
        }
        self.start_provisional(record, c, agreement)
    }

    fn merge_provisional(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        let p = &self.policy;

        if c.label == record.label && c.confidence >= p.min_confidence {
            record.window.push((c.observed_at, c.confidence));
            record.window.sort_by_key(|(t, _)| *t);
            if let Some(newest) = record.window.last().map(|(t, _)| *t) {
                let horizon = newest.minus_secs(p.confirm_window_secs);
                record.window.retain(|(t, _)| *t >= horizon);
            }

            let mean = record.window.iter().map(|(_, v)| v).sum::<f32>() / record.window.len() as f32;
            if record.window.len() >= p.confirm_count {
                record.window.clear();
                let label = record.label.clone();
                return self.confirm(record, label, mean, c.observed_at, None, HistoryKind::Confirmed, agreement);
            }

            record.set_confidence(mean, c.observed_at);
            record.record(HistoryKind::Provisional, c.observed_at, agreement);
            return (
                TransitionOutcome::ProvisionalUpdate { label: record.label.clone(), confidence: record.confidence },
                None,
            );
        }

        if c.label != record.label && c.confidence >= p.disagreement_threshold {
            return self.start_provisional(record, c, agreement);
        }

        self.observe(record, c, agreement);
        (TransitionOutcome::None, None)
    }

    fn merge_confirmed(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        let current = record.confidence_at(c.observed_at, self.policy.decay_lambda);

        if c.label == record.label {
            record.set_confidence(current.max(c.confidence), c.observed_at);
            record.record(HistoryKind::Observation, c.observed_at, agreement);
            return (TransitionOutcome::None, None);
        }

        if c.confidence >= self.policy.disagreement_threshold {
            let incumbent = record.label.clone();
            record.contest = Some(Contest {
                started: c.observed_at,
                incumbent: incumbent.clone(),
                votes: vec![
                    Vote { label: incumbent.clone(), confidence: current, at: c.observed_at },
                    Vote { label: c.label.clone(), confidence: c.confidence, at: c.observed_at },
                ],
            });
            record.state = DeviceState::Contested;
            record.set_confidence(current, c.observed_at);
            record.record(HistoryKind::Contested, c.observed_at, agreement);
            return (
                TransitionOutcome::Contested { incumbent, challenger: c.label.clone() },
                None,
            );
        }

        self.observe(record, c, agreement);
        (TransitionOutcome::None, None)
    }

    fn merge_contested(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        let settle = self.policy.contest_settle_secs as f64;
        let started = match record.contest.as_mut() {
            Some(contest) => {
                if c.confidence >= self.policy.min_confidence {
                    contest.votes.push(Vote { label: c.label.clone(), confidence: c.confidence, at: c.observed_at });
                }
                contest.started
            }
            None => {
                // Contested without a contest: fall back to confirmed
                record.state = DeviceState::Confirmed;
                return self.merge_confirmed(record, c, agreement);
            }
        };
        self.observe(record, c, agreement);

        if c.observed_at.secs_since(started) >= settle {
            return self.resolve_contest(record, c.observed_at);
        }
        (TransitionOutcome::None, None)
    }

    fn merge_stale(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        if c.confidence < self.policy.min_confidence {
            self.observe(record, c, agreement);
            return (TransitionOutcome::None, None);
        }
        if c.label == record.label {
            let label = record.label.clone();
            return self.confirm(record, label, c.confidence, c.observed_at, None, HistoryKind::Confirmed, agreement);
        }
        self.start_provisional(record, c, agreement)
    }

    /// Best-of-window vote; ties go to the incumbent
    fn resolve_contest(&self, record: &mut DeviceRecord, at: Timestamp) -> (TransitionOutcome, Option<Label>) {
        let contest = match record.contest.take() {
            Some(c) => c,
            None => return (TransitionOutcome::None, None),
        };

        let mut tally: BTreeMap<&Label, (f32, usize)> = BTreeMap::new();
        for vote in &contest.votes {
            let entry = tally.entry(&vote.label).or_insert((0.0, 0));
            entry.0 += vote.confidence;
            entry.1 += 1;
        }

        let incumbent_score = tally.get(&contest.incumbent).map_or(0.0, |(s, _)| *s);
        let mut winner = &contest.incumbent;
        let mut best = incumbent_score;
        for (label, (score, _)) in &tally {
            if *score > best {
                winner = label;
                best = *score;
            }
        }
        let (sum, count) = tally.get(winner).copied().unwrap_or((0.0, 1));
        let confidence = sum / count.max(1) as f32;

        let winner = winner.clone();
        let previous = (winner != contest.incumbent).then(|| contest.incumbent.clone());
        tracing::debug!(
            identity = %record.identity,
            incumbent = %contest.incumbent,
            winner = %winner,
            votes = contest.votes.len(),
            "Contest resolved"
        );
        self.confirm(record, winner, confidence, at, previous, HistoryKind::ContestResolved, 0)
    }

    fn start_provisional(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) -> (TransitionOutcome, Option<Label>) {
        record.state = DeviceState::Provisional;
        record.label = c.label.clone();
        record.window = vec![(c.observed_at, c.confidence)];

        if self.policy.confirm_count <= 1 {
            record.window.clear();
            return self.confirm(record, c.label.clone(), c.confidence, c.observed_at, None, HistoryKind::Confirmed, agreement);
        }

        record.set_confidence(c.confidence, c.observed_at);
        record.record(HistoryKind::Provisional, c.observed_at, agreement);
        (
            TransitionOutcome::ProvisionalUpdate { label: c.label.clone(), confidence: c.confidence },
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn confirm(
        &self,
        record: &mut DeviceRecord,
        label: Label,
        confidence: f32,
        at: Timestamp,
        previous: Option<Label>,
        kind: HistoryKind,
        agreement: u8,
    ) -> (TransitionOutcome, Option<Label>) {
        record.state = DeviceState::Confirmed;
        record.label = label.clone();
        record.set_confidence(confidence, at);
        record.record(kind, at, agreement);

        let enforce = if !record.ignored && record.enforcement.target() != Some(&label) {
            record.enforcement = crate::EnforcementStatus::Pending { label: label.clone() };
            Some(label.clone())
        } else {
            None
        };

        (
            TransitionOutcome::Confirmed { label, confidence: record.confidence, previous },
            enforce,
        )
    }

    /// History entry for a candidate that changed nothing
    fn observe(&self, record: &mut DeviceRecord, c: &Candidate, agreement: u8) {
        record.history.push(crate::record::HistoryEntry {
            at: c.observed_at,
            label: c.label.clone(),
            confidence: c.confidence,
            kind: HistoryKind::Observation,
            agreement,
        });
    }
}
