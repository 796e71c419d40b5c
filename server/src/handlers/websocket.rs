//! WebSocket handler for the change feed.
//!
//! A connection subscribes to keys of its owner and receives every write to
//! them as a `record` message. Pulls and pushes can also travel over the
//! socket; replies carry the request id the device chose.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use ensemble_engine::{
    collection::ensure_known,
    wire::{ClientMessage, ServerMessage},
};
use futures::{SinkExt, StreamExt};
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::websocket::ConnectionManager;

use super::{handle_pull, handle_push};

/// Handle an established WebSocket connection for `owner_id`.
///
/// Registers the connection, forwards queued messages to the socket from a
/// separate task, processes incoming messages until the peer goes away, and
/// drops every subscription on exit.
pub async fn handle_websocket_connection(
    socket: WebSocket,
    pool: PgPool,
    conn_manager: Arc<ConnectionManager>,
    owner_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_id = conn_manager.register(owner_id.clone(), tx);
    tracing::info!(conn_id = %conn_id, owner_id = %owner_id, "websocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!(error = %e, "failed to send websocket message");
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to serialize websocket message"),
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let reply =
                    process_message(text.as_str(), &pool, &conn_manager, &conn_id, &owner_id).await;
                if let Some(reply) = reply {
                    conn_manager.send_to(&conn_id, reply);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(conn_id = %conn_id, "binary messages not supported");
                conn_manager.send_to(
                    &conn_id,
                    ServerMessage::error("binary messages not supported", None),
                );
            }
            Ok(Message::Ping(data)) => tracing::trace!(bytes = data.len(), "received ping"),
            Ok(Message::Pong(_)) => tracing::trace!("received pong"),
            Ok(Message::Close(_)) => {
                tracing::debug!(conn_id = %conn_id, "websocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, error = %e, "websocket error");
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        owner_id = %owner_id,
        active_connections = conn_manager.connection_count(),
        active_owners = conn_manager.owner_count(),
        "websocket client disconnected"
    );
}

/// Process one client message. Returns the direct reply, if any.
async fn process_message(
    text: &str,
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    conn_id: &str,
    owner_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                format!("Invalid message format: {e}"),
                None,
            ))
        }
    };

    match client_msg {
        ClientMessage::Subscribe { key } => {
            if let Err(e) = ensure_known(&key) {
                return Some(ServerMessage::error(e.to_string(), None));
            }
            conn_manager.subscribe(conn_id, &key);
            Some(ServerMessage::Subscribed { key })
        }

        ClientMessage::Unsubscribe { key } => {
            conn_manager.unsubscribe(conn_id, &key);
            None
        }

        ClientMessage::Pull { key, request_id } => match handle_pull(pool, owner_id, &key).await {
            Ok(record) => Some(ServerMessage::PullResponse { record, request_id }),
            Err(e) => Some(ServerMessage::error(e.to_string(), request_id)),
        },

        ClientMessage::Push {
            key,
            data,
            device_id,
            request_id,
        } => match handle_push(pool, conn_manager, owner_id, &key, data, device_id).await {
            Ok(record) => Some(ServerMessage::PushResponse {
                timestamp: record.timestamp,
                request_id,
            }),
            Err(e) => Some(ServerMessage::error(e.to_string(), request_id)),
        },

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}
