//! Operator actions
//!
//! Received on the action topic as JSON, e.g.
//! `{"action": "ignore", "identity": "aa:bb:cc:dd:ee:ff"}`. Removals only
//! flag records; the sweeper removes them, still keeping any record whose
//! enforcement is pending. `reenforce` re-issues a confirmed record's
//! command, e.g. after the controller policy behind a rejection was fixed.

use rolewatch_common::{DeviceId, Label, RolewatchError, RolewatchResult};
use rolewatch_state::{DeviceState, DeviceStore};
use serde::{Deserialize, Serialize};

/// Operator action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum OperatorAction {
    /// Keep tracking the identity but never enforce it
    Ignore {
        /// Device identity
        identity: String,
    },
    /// Resume enforcement for all ignored identities
    ClearIgnored,
    /// Remove one record at the next sweep
    Remove {
        /// Device identity
        identity: String,
    },
    /// Remove every ignored record at the next sweep
    RemoveIgnored,
    /// Remove every stale record at the next sweep
    RemoveInactive,
    /// Send the confirmed label to the controller again
    #[serde(alias = "update-acls")]
    Reenforce {
        /// Device identity
        identity: String,
    },
}

/// Effect of an applied action
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActionResult {
    /// Records affected
    pub affected: usize,
    /// Command to queue with the emitter
    pub enforce: Option<(DeviceId, Label)>,
}

impl ActionResult {
    fn affected(affected: usize) -> Self {
        Self { affected, enforce: None }
    }
}

impl OperatorAction {
    /// Parse an action message
    pub fn from_slice(payload: &[u8]) -> RolewatchResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| RolewatchError::MalformedObservation(format!("operator action: {}", e)))
    }

    /// Apply to the store
    pub fn apply(&self, store: &DeviceStore) -> RolewatchResult<ActionResult> {
        let result = match self {
            OperatorAction::Ignore { identity } => {
                store.ignore(&DeviceId::parse(identity)?);
                ActionResult::affected(1)
            }
            OperatorAction::ClearIgnored => ActionResult::affected(store.clear_ignored()),
            OperatorAction::Remove { identity } => {
                ActionResult::affected(usize::from(store.flag_remove(&DeviceId::parse(identity)?)))
            }
            OperatorAction::RemoveIgnored => ActionResult::affected(store.flag_remove_where(|r| r.ignored)),
            OperatorAction::RemoveInactive => {
                ActionResult::affected(store.flag_remove_where(|r| r.state == DeviceState::Stale))
            }
            OperatorAction::Reenforce { identity } => {
                let identity = DeviceId::parse(identity)?;
                match store.reenforce(&identity) {
                    Some(label) => ActionResult { affected: 1, enforce: Some((identity, label)) },
                    None => {
                        tracing::warn!(identity = %identity, "Nothing to re-enforce: not a confirmed, enforceable record");
                        ActionResult::default()
                    }
                }
            }
        };
        tracing::info!(action = ?self, affected = result.affected, "Operator action applied");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolewatch_common::Timestamp;
    use rolewatch_ml::{Candidate, Verdict};
    use rolewatch_state::{CoordinatorPolicy, EnforcementResult};

    fn seeded_store() -> DeviceStore {
        let store = DeviceStore::new(CoordinatorPolicy::default(), 4, 100);
        for n in 0..3u8 {
            let at = Timestamp::from_secs(1);
            store
                .merge(&Verdict {
                    identity: DeviceId::parse(&format!("aa:bb:cc:dd:ee:{:02x}", n)).unwrap(),
                    observed_at: at,
                    fingerprint: 1,
                    candidates: vec![Candidate::new(Label::new("camera"), 0.9, "test", at)],
                    degraded: Vec::new(),
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn test_parse() {
        let a = OperatorAction::from_slice(br#"{"action":"ignore","identity":"AA-BB-CC-DD-EE-00"}"#).unwrap();
        assert_eq!(a, OperatorAction::Ignore { identity: "AA-BB-CC-DD-EE-00".into() });
        assert_eq!(
            OperatorAction::from_slice(br#"{"action":"clear-ignored"}"#).unwrap(),
            OperatorAction::ClearIgnored
        );
        assert!(OperatorAction::from_slice(br#"{"action":"reboot"}"#).is_err());
    }

    #[test]
    fn test_ignore_then_remove_ignored() {
        let store = seeded_store();
        let action = OperatorAction::from_slice(br#"{"action":"ignore","identity":"AA-BB-CC-DD-EE-00"}"#).unwrap();
        action.apply(&store).unwrap();
        assert!(store.is_ignored(&DeviceId::parse("aa:bb:cc:dd:ee:00").unwrap()));

        assert_eq!(OperatorAction::RemoveIgnored.apply(&store).unwrap().affected, 1);
        store.sweep(Timestamp::from_secs(2));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_remove_unknown_identity() {
        let store = seeded_store();
        let action = OperatorAction::Remove { identity: "aa:bb:cc:dd:ee:99".into() };
        assert_eq!(action.apply(&store).unwrap().affected, 0);

        let bad = OperatorAction::Remove { identity: "".into() };
        assert!(bad.apply(&store).is_err());
    }

    #[test]
    fn test_reenforce_confirmed_record() {
        let store = seeded_store();
        let id = DeviceId::parse("aa:bb:cc:dd:ee:01").unwrap();
        for secs in [2, 3] {
            let at = Timestamp::from_secs(secs);
            store
                .merge(&Verdict {
                    identity: id.clone(),
                    observed_at: at,
                    fingerprint: secs,
                    candidates: vec![Candidate::new(Label::new("camera"), 0.9, "test", at)],
                    degraded: Vec::new(),
                })
                .unwrap();
        }
        store.settle_enforcement(&id, &Label::new("camera"), EnforcementResult::Rejected("no such vlan".into()));
        assert!(store.pending_enforcements().is_empty());

        let action = OperatorAction::from_slice(br#"{"action":"reenforce","identity":"aa:bb:cc:dd:ee:01"}"#).unwrap();
        let result = action.apply(&store).unwrap();
        assert_eq!(result.affected, 1);
        assert_eq!(result.enforce, Some((id.clone(), Label::new("camera"))));
        assert_eq!(store.pending_enforcements(), vec![(id, Label::new("camera"))]);

        let alias = OperatorAction::from_slice(br#"{"action":"update-acls","identity":"aa:bb:cc:dd:ee:02"}"#).unwrap();
        assert_eq!(alias.apply(&store).unwrap(), ActionResult::default());
    }
}
