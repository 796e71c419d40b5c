//! Pull handler - serves the current document for one key.

use crate::db;
use crate::error::{AppError, Result};
use ensemble_engine::{collection::ensure_known, SyncRecord};
use sqlx::PgPool;

/// Fetch the caller's document for `key`.
pub async fn handle_pull(pool: &PgPool, owner_id: &str, key: &str) -> Result<Option<SyncRecord>> {
    ensure_known(key)?;

    let Some(stored) = db::get_document(pool, owner_id, key).await? else {
        tracing::debug!(owner_id, key, "pull of absent document");
        return Ok(None);
    };

    let record = stored
        .into_record()
        .map_err(|e| AppError::Internal(format!("stored document {key} is corrupt: {e}")))?;

    tracing::debug!(owner_id, key, timestamp = record.timestamp, "pull");
    Ok(Some(record))
}
