//! The remote-side representation of a collection snapshot.

use crate::{error::Result, Collection, CollectionKey, DeviceId, Error, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// One document in the remote store: a whole collection plus provenance.
///
/// For a given `(owner_id, key)` the remote holds the record with the highest
/// timestamp it has accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    /// Collection key, e.g. `"performances"`
    pub key: CollectionKey,
    /// Full collection contents
    pub data: Collection,
    /// Server-assigned, monotonically increasing
    pub timestamp: Timestamp,
    /// Device that wrote this record
    pub device_id: DeviceId,
    /// Owner of the document
    pub owner_id: UserId,
}

impl SyncRecord {
    pub fn new(
        key: impl Into<CollectionKey>,
        data: Collection,
        timestamp: Timestamp,
        device_id: DeviceId,
        owner_id: impl Into<UserId>,
    ) -> Self {
        Self {
            key: key.into(),
            data,
            timestamp,
            device_id,
            owner_id: owner_id.into(),
        }
    }

    /// Whether this record was written by `device`.
    pub fn is_echo_for(&self, device: &DeviceId) -> bool {
        &self.device_id == device
    }

    /// Parse a record from JSON, rejecting non-array `data`.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidRecord(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn members() -> Collection {
        vec![json!({"id": "m1", "name": "Ana"})].into()
    }

    #[test]
    fn document_shape() {
        let record = SyncRecord::new("members", members(), 7, DeviceId::new("dev-a"), "owner-1");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "key": "members",
                "data": [{"id": "m1", "name": "Ana"}],
                "timestamp": 7,
                "deviceId": "dev-a",
                "ownerId": "owner-1"
            })
        );
    }

    #[test]
    fn echo_detection() {
        let record = SyncRecord::new("members", members(), 7, DeviceId::new("dev-a"), "owner-1");
        assert!(record.is_echo_for(&DeviceId::new("dev-a")));
        assert!(!record.is_echo_for(&DeviceId::new("dev-b")));
    }

    #[test]
    fn from_json_rejects_object_data() {
        let json = r#"{"key":"members","data":{"id":"m1"},"timestamp":1,"deviceId":"d","ownerId":"o"}"#;
        assert!(matches!(
            SyncRecord::from_json(json),
            Err(Error::InvalidRecord(_))
        ));
    }
}
