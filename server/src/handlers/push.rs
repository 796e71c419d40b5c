//! Push handler - accepts a new version of one document.
//!
//! The server does not compare timestamps on push: the device decided to
//! write, and the latest arrival wins. Every accepted write is broadcast to
//! the owner's subscribers, the writer included, so devices can tell their
//! own echoes apart by `deviceId`.

use crate::db;
use crate::error::{AppError, Result};
use crate::websocket::ConnectionManager;
use ensemble_engine::{collection::ensure_known, wire::PushRequest, Collection, DeviceId, SyncRecord};
use sqlx::PgPool;

/// Check an HTTP push body against the authenticated owner.
pub fn validate_push(owner_id: &str, key: &str, request: PushRequest) -> Result<(Collection, DeviceId)> {
    ensure_known(key)?;

    if request.owner_id != owner_id {
        return Err(AppError::Forbidden(format!(
            "ownerId {} does not match the authenticated owner",
            request.owner_id
        )));
    }

    let data = Collection::from_value(key, request.data)?;
    check_device(&request.device_id)?;
    Ok((data, request.device_id))
}

pub fn check_device(device_id: &DeviceId) -> Result<()> {
    if device_id.as_str().trim().is_empty() {
        return Err(AppError::BadRequest("deviceId must not be empty".to_string()));
    }
    Ok(())
}

/// Store `data` as the new document and notify subscribers.
pub async fn handle_push(
    pool: &PgPool,
    conn_manager: &ConnectionManager,
    owner_id: &str,
    key: &str,
    data: Collection,
    device_id: DeviceId,
) -> Result<SyncRecord> {
    ensure_known(key)?;
    check_device(&device_id)?;

    let timestamp = db::upsert_document(pool, owner_id, key, &data, &device_id).await?;
    let record = SyncRecord::new(key, data, timestamp, device_id, owner_id);

    let delivered = conn_manager.broadcast(&record);
    tracing::debug!(
        owner_id,
        key,
        timestamp,
        device_id = %record.device_id,
        entities = record.data.len(),
        delivered,
        "document accepted"
    );

    Ok(record)
}
