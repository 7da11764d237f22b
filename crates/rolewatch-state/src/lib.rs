//! Device state: records, decay, the coordinator state machine and the
//! sharded device store
//!
//! Workers never touch a [`DeviceRecord`] directly. Every mutation is a
//! [`DeviceStore::merge`] (which runs the [`Coordinator`] under the shard
//! lock) or a [`DeviceStore::sweep`].

#![warn(missing_docs)]

pub mod coordinator;
pub mod decay;
pub mod persist;
pub mod policy;
pub mod record;
pub mod store;

pub use coordinator::{Coordinator, SweepDecision, Transition, TransitionOutcome};
pub use decay::{decay, decayed_at};
pub use policy::CoordinatorPolicy;
pub use record::{
    Contest, DeviceRecord, DeviceSnapshot, DeviceState, EnforcementStatus, History, HistoryEntry,
    HistoryKind, Vote,
};
pub use store::{DeviceStore, EnforcementResult, SweepReport};
