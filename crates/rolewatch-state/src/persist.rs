//! JSON checkpoints
//!
//! Records (history, seen set and enforcement status included) are written
//! to a temporary file and renamed into place, so a crash mid-write leaves
//! the previous checkpoint intact.

use crate::record::DeviceRecord;
use crate::DeviceStore;
use rolewatch_common::{DeviceId, RolewatchResult, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::Path;

const CHECKPOINT_VERSION: u32 = 1;

/// On-disk store image
#[derive(Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Format version
    pub version: u32,
    /// Write time
    pub written_at: Timestamp,
    /// Ignored identities
    #[serde(default)]
    pub ignored: Vec<DeviceId>,
    /// Device records
    pub records: Vec<DeviceRecord>,
}

/// Write the store to `path`
pub fn save(store: &DeviceStore, path: impl AsRef<Path>, now: Timestamp) -> RolewatchResult<usize> {
    let path = path.as_ref();
    let checkpoint = Checkpoint {
        version: CHECKPOINT_VERSION,
        written_at: now,
        ignored: store.ignored(),
        records: store.export(),
    };
    let count = checkpoint.records.len();

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec(&checkpoint)?)?;
    std::fs::rename(&tmp, path)?;

    tracing::debug!(path = %path.display(), records = count, "Checkpoint written");
    Ok(count)
}

/// Read a checkpoint; `None` when the file does not exist
pub fn load(path: impl AsRef<Path>) -> RolewatchResult<Option<Checkpoint>> {
    let content = match std::fs::read(path.as_ref()) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&content)?))
}

/// Load `path` into `store`, returning the number of restored records
pub fn restore(store: &DeviceStore, path: impl AsRef<Path>) -> RolewatchResult<usize> {
    let Some(checkpoint) = load(path.as_ref())? else {
        return Ok(0);
    };
    if checkpoint.version != CHECKPOINT_VERSION {
        tracing::warn!(
            "Checkpoint {} has version {}, expected {}; ignoring",
            path.as_ref().display(),
            checkpoint.version,
            CHECKPOINT_VERSION
        );
        return Ok(0);
    }

    let count = checkpoint.records.len();
    store.restore(checkpoint.records, checkpoint.ignored);
    tracing::info!(
        "Restored {} device records from checkpoint written {}",
        count,
        checkpoint.written_at.to_rfc3339()
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoordinatorPolicy;
    use rolewatch_common::Label;
    use rolewatch_ml::{Candidate, Verdict};

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("rolewatch-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_save_and_restore() {
        let store = DeviceStore::new(CoordinatorPolicy::default(), 4, 100);
        let id = DeviceId::parse("aa:bb:cc:dd:ee:ff").unwrap();
        for secs in [1, 2, 3] {
            let at = Timestamp::from_secs(secs);
            store
                .merge(&Verdict {
                    identity: id.clone(),
                    observed_at: at,
                    fingerprint: secs,
                    candidates: vec![Candidate::new(Label::new("printer"), 0.9, "test", at)],
                    degraded: Vec::new(),
                })
                .unwrap();
        }
        store.ignore(&DeviceId::parse("11:22:33:44:55:66").unwrap());

        let path = temp_path("roundtrip");
        assert_eq!(save(&store, &path, Timestamp::from_secs(10)).unwrap(), 1);

        let restored = DeviceStore::new(CoordinatorPolicy::default(), 16, 100);
        assert_eq!(restore(&restored, &path).unwrap(), 1);
        assert_eq!(restored.record(&id), store.record(&id));
        assert_eq!(restored.pending_enforcements().len(), 1);
        assert_eq!(restored.ignored().len(), 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_checkpoint() {
        let store = DeviceStore::new(CoordinatorPolicy::default(), 4, 100);
        assert_eq!(restore(&store, temp_path("missing")).unwrap(), 0);
        assert!(load(temp_path("missing")).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(load(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
