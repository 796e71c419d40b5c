//! Database operations for the sync_documents table.

use ensemble_engine::{Collection, DeviceId, SyncRecord, Timestamp};
use sqlx::{types::Json, PgPool, Row};

/// A stored document row.
#[derive(Debug)]
pub struct StoredDocument {
    pub owner_id: String,
    pub key: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
    pub device_id: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredDocument {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredDocument {
            owner_id: row.try_get("owner_id")?,
            key: row.try_get("key")?,
            data: row.try_get("data")?,
            timestamp: row.try_get("timestamp")?,
            device_id: row.try_get("device_id")?,
        })
    }
}

impl StoredDocument {
    /// Convert the row into the record devices receive.
    pub fn into_record(self) -> Result<SyncRecord, ensemble_engine::Error> {
        let data = Collection::from_value(&self.key, self.data)?;
        Ok(SyncRecord::new(
            self.key,
            data,
            u64::try_from(self.timestamp).unwrap_or(0),
            DeviceId::new(self.device_id),
            self.owner_id,
        ))
    }
}

/// Fetch the document `key` of `owner_id`.
pub async fn get_document(
    pool: &PgPool,
    owner_id: &str,
    key: &str,
) -> Result<Option<StoredDocument>, sqlx::Error> {
    sqlx::query_as::<_, StoredDocument>(
        r#"
        SELECT owner_id, key, data, timestamp, device_id
        FROM sync_documents
        WHERE owner_id = $1 AND key = $2
        "#,
    )
    .bind(owner_id)
    .bind(key)
    .fetch_optional(pool)
    .await
}

/// Replace the document `key` of `owner_id`, returning the timestamp the
/// server assigned to the write.
///
/// The clock bump and the upsert share a transaction, so timestamps are
/// unique and their order matches commit order.
pub async fn upsert_document(
    pool: &PgPool,
    owner_id: &str,
    key: &str,
    data: &Collection,
    device_id: &DeviceId,
) -> Result<Timestamp, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let (timestamp,): (i64,) = sqlx::query_as(
        r#"
        UPDATE sync_clock
        SET value = GREATEST(value + 1, $1)
        WHERE id = 1
        RETURNING value
        "#,
    )
    .bind(chrono::Utc::now().timestamp_millis())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO sync_documents (owner_id, key, data, timestamp, device_id)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (owner_id, key) DO UPDATE SET
            data = EXCLUDED.data,
            timestamp = EXCLUDED.timestamp,
            device_id = EXCLUDED.device_id,
            updated_at = now()
        "#,
    )
    .bind(owner_id)
    .bind(key)
    .bind(Json(data))
    .bind(timestamp)
    .bind(device_id.as_str())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(u64::try_from(timestamp).unwrap_or(0))
}
