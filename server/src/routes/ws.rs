//! WebSocket upgrade endpoint.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use crate::auth::AuthUser;
use crate::handlers::handle_websocket_connection;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to the change feed of the authenticated owner.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, auth: AuthUser) -> Response {
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.pool, state.conn_manager, auth.owner_id)
    })
}
