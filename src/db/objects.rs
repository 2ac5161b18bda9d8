//! Published object database operations

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::upload::StoredObject;

/// Published object record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ObjectRecord {
    pub etag: String,
    pub object_key: String,
    pub url: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub upload_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ObjectRecord> for StoredObject {
    type Error = AppError;

    fn try_from(record: ObjectRecord) -> Result<Self> {
        let upload_id = Uuid::parse_str(&record.upload_id).map_err(|e| {
            AppError::Internal(format!("Corrupt upload id for {}: {}", record.etag, e))
        })?;

        Ok(StoredObject {
            etag: record.etag,
            object_key: record.object_key,
            file_url: record.url,
            file_name: record.file_name,
            file_size: record.file_size.max(0) as u64,
            file_type: record.file_type,
            upload_id,
        })
    }
}

/// Object repository
pub struct ObjectRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ObjectRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Find an object by its content hash
    pub async fn get_by_etag(&self, etag: &str) -> Result<Option<ObjectRecord>> {
        let record = sqlx::query_as::<_, ObjectRecord>(
            r#"
            SELECT etag, object_key, url, file_name, file_size, file_type,
                   upload_id, created_at, updated_at
            FROM objects
            WHERE etag = ?
            "#,
        )
        .bind(etag)
        .fetch_optional(self.pool)
        .await?;

        Ok(record)
    }

    /// Insert or replace the object stored for a content hash
    pub async fn upsert(&self, object: &StoredObject) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO objects (etag, object_key, url, file_name, file_size,
                                 file_type, upload_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(etag) DO UPDATE SET
                object_key = excluded.object_key,
                url = excluded.url,
                file_name = excluded.file_name,
                file_size = excluded.file_size,
                file_type = excluded.file_type,
                upload_id = excluded.upload_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&object.etag)
        .bind(&object.object_key)
        .bind(&object.file_url)
        .bind(&object.file_name)
        .bind(object.file_size as i64)
        .bind(&object.file_type)
        .bind(object.upload_id.to_string())
        .bind(&now)
        .bind(&now)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Most recently published objects
    pub async fn recent(&self, limit: usize) -> Result<Vec<ObjectRecord>> {
        let records = sqlx::query_as::<_, ObjectRecord>(
            r#"
            SELECT etag, object_key, url, file_name, file_size, file_type,
                   upload_id, created_at, updated_at
            FROM objects
            ORDER BY updated_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
