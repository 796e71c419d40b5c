//! Identity value objects passed into the services that need them.

use crate::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of one installation.
///
/// Created once on first run and never rotated. Every write is tagged with it
/// so a device can recognise its own writes when the change feed echoes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for DeviceId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DeviceId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Who is writing, from where.
///
/// Immutable for the lifetime of a signed-in session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Owner of the remote documents (the ensemble account)
    pub owner_id: UserId,
    /// This installation
    pub device_id: DeviceId,
}

impl Session {
    pub fn new(owner_id: impl Into<UserId>, device_id: DeviceId) -> Self {
        Self {
            owner_id: owner_id.into(),
            device_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_a_bare_string_on_the_wire() {
        let id = DeviceId::new("device-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), r#""device-1""#);
        assert_eq!(id, "device-1");
    }

    #[test]
    fn session_serialization_format() {
        let session = Session::new("owner-1", DeviceId::new("device-1"));
        let json = serde_json::to_string(&session).unwrap();
        assert_eq!(json, r#"{"ownerId":"owner-1","deviceId":"device-1"}"#);
    }
}
