//! Error types for rolewatch

use crate::Timestamp;
use thiserror::Error;

/// rolewatch error type
///
/// Every failure is scoped to the single observation or identity being
/// processed; the variant alone tells a worker whether to acknowledge, drop
/// or leave a message for redelivery.
#[derive(Error, Debug)]
pub enum RolewatchError {
    /// Identity or timestamp could not be recovered from an observation
    #[error("malformed observation: {0}")]
    MalformedObservation(String),

    /// A classifier stage could not run (treated as abstain)
    #[error("classifier stage {stage} unavailable: {reason}")]
    ClassifierUnavailable {
        /// Stage name
        stage: String,
        /// Why the stage could not run
        reason: String,
    },

    /// Two different observations claimed the same (identity, timestamp)
    #[error("merge conflict for {identity} at {observed_at}")]
    MergeConflict {
        /// Device identity
        identity: String,
        /// Conflicting observation timestamp
        observed_at: Timestamp,
    },

    /// Controller unreachable or unavailable
    #[error("enforcement failed, retryable: {0}")]
    EnforcementRetryable(String),

    /// Controller rejected the command
    #[error("enforcement rejected: {0}")]
    EnforcementPermanent(String),

    /// Device store cannot accept the merge
    #[error("device store unavailable: {0}")]
    StoreUnavailable(String),

    /// Broker receive/ack failure
    #[error("broker error: {0}")]
    Broker(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RolewatchError {
    /// Whether retrying the same work later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RolewatchError::EnforcementRetryable(_)
                | RolewatchError::StoreUnavailable(_)
                | RolewatchError::Broker(_)
                | RolewatchError::Io(_)
        )
    }

    /// Short machine-readable kind, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            RolewatchError::MalformedObservation(_) => "malformed_observation",
            RolewatchError::ClassifierUnavailable { .. } => "classifier_unavailable",
            RolewatchError::MergeConflict { .. } => "merge_conflict",
            RolewatchError::EnforcementRetryable(_) => "enforcement_retryable",
            RolewatchError::EnforcementPermanent(_) => "enforcement_permanent",
            RolewatchError::StoreUnavailable(_) => "store_unavailable",
            RolewatchError::Broker(_) => "broker",
            RolewatchError::Config(_) => "config",
            RolewatchError::Io(_) => "io",
            RolewatchError::Serialization(_) => "serialization",
        }
    }
}

/// Result type for rolewatch
pub type RolewatchResult<T> = Result<T, RolewatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!RolewatchError::MalformedObservation("x".into()).is_retryable());
        assert!(!RolewatchError::EnforcementPermanent("denied".into()).is_retryable());
        assert!(RolewatchError::StoreUnavailable("full".into()).is_retryable());
        assert!(RolewatchError::EnforcementRetryable("503".into()).is_retryable());
    }
}
