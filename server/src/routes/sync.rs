//! Document endpoints.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use ensemble_engine::{
    wire::{PushRequest, PushResponse},
    SyncRecord,
};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::handlers::{handle_pull, handle_push, validate_push};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/sync/{key}", get(pull_handler).put(push_handler))
}

/// GET /sync/{key} - Current document, 404 when never written.
async fn pull_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(key): Path<String>,
) -> Result<Json<SyncRecord>> {
    handle_pull(&state.pool, &auth.owner_id, &key)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("no document for {key}")))
}

/// PUT /sync/{key} - Replace the document; returns the assigned timestamp.
async fn push_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(key): Path<String>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>> {
    let (data, device_id) = validate_push(&auth.owner_id, &key, request)?;
    let record = handle_push(
        &state.pool,
        &state.conn_manager,
        &auth.owner_id,
        &key,
        data,
        device_id,
    )
    .await?;

    Ok(Json(PushResponse {
        timestamp: record.timestamp,
    }))
}
