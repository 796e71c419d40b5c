//! Local snapshots of a collection.
//!
//! A snapshot is what the device keeps on disk for one collection key: the
//! full contents and the timestamp that last touched them. Snapshots are the
//! bridge between the orchestrator and whatever key/value persistence the
//! platform offers.

use crate::{error::Result, Collection, Error, Timestamp};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

fn default_format_version() -> u32 {
    SNAPSHOT_FORMAT_VERSION
}

/// The locally persisted state of one collection.
///
/// `last_modified` is the larger of the most recently applied remote
/// timestamp and the local clock at the last local write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    /// Snapshot format version
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// Collection contents
    pub data: Collection,
    /// Ordering timestamp of this snapshot
    pub last_modified: Timestamp,
}

impl LocalSnapshot {
    pub fn new(data: Collection, last_modified: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            data,
            last_modified,
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_shape() {
        let snapshot = LocalSnapshot::new(vec![json!({"id": "p1"})].into(), 1_700);
        let value: serde_json::Value =
            serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"formatVersion": 1, "data": [{"id": "p1"}], "lastModified": 1_700})
        );
    }

    #[test]
    fn reads_snapshots_without_format_version() {
        let snapshot = LocalSnapshot::from_json(r#"{"data":[],"lastModified":5}"#).unwrap();
        assert_eq!(snapshot.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(snapshot.last_modified, 5);
        assert!(snapshot.data.is_empty());
    }

    #[test]
    fn rejects_future_format() {
        let err =
            LocalSnapshot::from_json(r#"{"formatVersion":99,"data":[],"lastModified":5}"#)
                .unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(msg) if msg.contains("99")));
    }

    #[test]
    fn rejects_garbage() {
        assert!(LocalSnapshot::from_json("not json").is_err());
        assert!(LocalSnapshot::from_json(r#"{"data":{},"lastModified":5}"#).is_err());
    }
}
