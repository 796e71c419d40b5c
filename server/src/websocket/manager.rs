//! WebSocket connection manager.
//!
//! Tracks active connections, the keys each one subscribed to, and which
//! connections belong to which owner.

use std::{collections::BTreeSet, sync::Arc};

use dashmap::DashMap;
use ensemble_engine::{wire::ServerMessage, CollectionKey, SyncRecord, UserId};
use tokio::sync::mpsc;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Owner authenticated on upgrade
    pub owner_id: UserId,
    /// Channel to send messages to this connection
    pub sender: MessageSender,
    pub keys: BTreeSet<CollectionKey>,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Connection IDs per owner.
    by_owner: DashMap<UserId, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, owner_id: UserId, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                owner_id: owner_id.clone(),
                sender,
                keys: BTreeSet::new(),
            },
        );
        self.by_owner
            .entry(owner_id)
            .or_default()
            .push(conn_id.clone());

        conn_id
    }

    /// Unregister a connection and drop its subscriptions.
    pub fn unregister(&self, conn_id: &str) {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return;
        };

        if let Some(mut conn_ids) = self.by_owner.get_mut(&conn.owner_id) {
            conn_ids.retain(|id| id != conn_id);
            if conn_ids.is_empty() {
                drop(conn_ids);
                self.by_owner.remove_if(&conn.owner_id, |_, ids| ids.is_empty());
            }
        }

        tracing::debug!(
            conn_id = %conn_id,
            owner_id = %conn.owner_id,
            subscriptions = conn.keys.len(),
            "websocket connection unregistered"
        );
    }

    /// Subscribe a connection to `key`. Returns false for unknown connections.
    pub fn subscribe(&self, conn_id: &str, key: &str) -> bool {
        match self.connections.get_mut(conn_id) {
            Some(mut conn) => {
                conn.keys.insert(key.to_string());
                true
            }
            None => false,
        }
    }

    /// Returns whether the connection was subscribed to `key`.
    pub fn unsubscribe(&self, conn_id: &str, key: &str) -> bool {
        self.connections
            .get_mut(conn_id)
            .is_some_and(|mut conn| conn.keys.remove(key))
    }

    /// Deliver `record` to every connection of its owner subscribed to its
    /// key, the writing connection included.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast(&self, record: &SyncRecord) -> usize {
        let targets: Vec<String> = match self.by_owner.get(&record.owner_id) {
            Some(ids) => ids.clone(),
            None => return 0,
        };

        let message = ServerMessage::record(record.clone());
        let mut sent_count = 0;
        for conn_id in targets {
            let Some(conn) = self.connections.get(&conn_id) else {
                continue;
            };
            if conn.keys.contains(&record.key) && conn.sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::trace!(
            key = %record.key,
            owner_id = %record.owner_id,
            recipients = sent_count,
            "broadcast record"
        );
        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of owners with at least one connection.
    pub fn owner_count(&self) -> usize {
        self.by_owner.len()
    }
}
