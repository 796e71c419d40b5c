//! JSON messages exchanged between devices and the remote store.
//!
//! HTTP bodies use camelCase. WebSocket messages are tagged by `type` and use
//! snake_case field names.

use crate::{Collection, CollectionKey, DeviceId, SyncRecord, Timestamp, UserId};
use serde::{Deserialize, Serialize};

/// Body of `PUT /sync/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub data: serde_json::Value,
    pub device_id: DeviceId,
    pub owner_id: UserId,
}

/// Response of `PUT /sync/{key}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Server-assigned timestamp of the accepted record
    pub timestamp: Timestamp,
}

/// Messages sent from device to server over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving every write to `key`.
    Subscribe { key: CollectionKey },

    /// Stop receiving writes to `key`.
    Unsubscribe { key: CollectionKey },

    /// Fetch the current record for `key`.
    Pull {
        key: CollectionKey,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Write a new record for `key`.
    Push {
        key: CollectionKey,
        data: Collection,
        device_id: DeviceId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to device over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Subscription to `key` is active.
    Subscribed { key: CollectionKey },

    /// A write to a subscribed key. Delivered to every subscriber, the
    /// writing connection included.
    Record { record: SyncRecord },

    /// Response to a pull request.
    PullResponse {
        record: Option<SyncRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to a push request.
    PushResponse {
        timestamp: Timestamp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Response to ping.
    Pong,

    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Create a change-feed notification.
    pub fn record(record: SyncRecord) -> Self {
        ServerMessage::Record { record }
    }
}
