//! rolewatch common - shared types for the device role classifier
//!
//! This crate provides the value types every other rolewatch crate agrees on:
//! - Device identities and role labels
//! - The observation wire format published by capture agents
//! - Millisecond timestamps used as the clock for decay and windows
//! - The error taxonomy shared by every crate

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identity;
pub mod observation;

pub use error::*;
pub use identity::{DeviceId, Label};
pub use observation::{FlowTuple, Observation};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Millisecond timestamp since the Unix epoch
///
/// Observation timestamps (not wall clock) drive merge-time decay, so that
/// replaying the same observations always yields the same record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Get current wall-clock timestamp
    #[inline]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }

    /// Create from milliseconds since epoch
    #[inline(always)]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Create from whole seconds since epoch
    #[inline(always)]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs * 1000)
    }

    /// Create from fractional seconds; `None` for negative or non-finite input
    pub fn from_secs_f64(secs: f64) -> Option<Self> {
        if !secs.is_finite() || secs < 0.0 {
            return None;
        }
        Some(Self((secs * 1000.0).round() as u64))
    }

    /// Get milliseconds value
    #[inline(always)]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Seconds elapsed since `earlier`, zero if `earlier` is in the future
    #[inline]
    pub fn secs_since(&self, earlier: Timestamp) -> f64 {
        self.0.saturating_sub(earlier.0) as f64 / 1000.0
    }

    /// Timestamp shifted forward by `secs`
    #[inline]
    pub fn plus_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_add(secs.saturating_mul(1000)))
    }

    /// Timestamp shifted backward by `secs`, clamped at the epoch
    #[inline]
    pub fn minus_secs(&self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs.saturating_mul(1000)))
    }

    /// RFC 3339 rendering for reports
    pub fn to_rfc3339(&self) -> String {
        chrono::DateTime::<chrono::Utc>::from_timestamp_millis(self.0 as i64)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_secs_f64() {
        assert_eq!(Timestamp::from_secs_f64(1.25), Some(Timestamp::from_millis(1250)));
        assert_eq!(Timestamp::from_secs_f64(-1.0), None);
        assert_eq!(Timestamp::from_secs_f64(f64::NAN), None);
    }

    #[test]
    fn test_secs_since_saturates() {
        let t1 = Timestamp::from_secs(100);
        let t2 = Timestamp::from_secs(160);
        assert!((t2.secs_since(t1) - 60.0).abs() < 1e-9);
        assert_eq!(t1.secs_since(t2), 0.0);
    }
}
