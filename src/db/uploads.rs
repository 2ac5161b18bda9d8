//! Upload session database operations

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::upload::{SessionStatus, UploadSession};

/// Upload session record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UploadRecord {
    pub id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_type: String,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub file_md5: Option<String>,
    pub status: String,
    pub file_url: Option<String>,
    pub object_key: Option<String>,
    pub etag: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
}

impl UploadRecord {
    /// Rebuild the session this record describes
    pub fn into_session(self, received_chunks: BTreeSet<usize>) -> Result<UploadSession> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            AppError::Internal(format!("Corrupt {} for upload {}: {}", what, self.id, e))
        };

        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt("id", &e))?;
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(|e| corrupt("status", &e))?;
        let created_at = parse_timestamp(&self.created_at).map_err(|e| corrupt("created_at", &e))?;
        let updated_at = parse_timestamp(&self.updated_at).map_err(|e| corrupt("updated_at", &e))?;
        let expires_at = parse_timestamp(&self.expires_at).map_err(|e| corrupt("expires_at", &e))?;

        Ok(UploadSession {
            id,
            file_name: self.file_name,
            file_size: self.file_size.max(0) as u64,
            file_type: self.file_type,
            chunk_size: self.chunk_size.max(0) as u64,
            total_chunks: self.total_chunks.max(0) as usize,
            file_md5: self.file_md5,
            received_chunks,
            status,
            file_url: self.file_url,
            object_key: self.object_key,
            etag: self.etag,
            created_at,
            updated_at,
            expires_at,
        })
    }
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|t| t.with_timezone(&Utc))
}

/// Upload session repository
pub struct UploadRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> UploadRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the session row; received chunks are kept
    pub async fn upsert(&self, session: &UploadSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO upload_sessions (id, file_name, file_size, file_type, chunk_size,
                                         total_chunks, file_md5, status, file_url, object_key,
                                         etag, created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                file_url = excluded.file_url,
                object_key = excluded.object_key,
                etag = excluded.etag,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(session.id.to_string())
        .bind(&session.file_name)
        .bind(session.file_size as i64)
        .bind(&session.file_type)
        .bind(session.chunk_size as i64)
        .bind(session.total_chunks as i64)
        .bind(&session.file_md5)
        .bind(session.status.as_str())
        .bind(&session.file_url)
        .bind(&session.object_key)
        .bind(&session.etag)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .bind(session.expires_at.to_rfc3339())
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Record a received chunk and the session status it leads to
    pub async fn record_chunk(
        &self,
        id: Uuid,
        chunk_index: usize,
        status: SessionStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO upload_chunks (upload_id, chunk_index, received_at)
            VALUES (?, ?, ?)
            ON CONFLICT(upload_id, chunk_index) DO UPDATE SET received_at = excluded.received_at
            "#,
        )
        .bind(id.to_string())
        .bind(chunk_index as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE upload_sessions SET status = ?, updated_at = ?, expires_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(expires_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a session and its chunk rows
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM upload_chunks WHERE upload_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Every stored session
    pub async fn all(&self) -> Result<Vec<UploadRecord>> {
        let records = sqlx::query_as::<_, UploadRecord>(
            r#"
            SELECT id, file_name, file_size, file_type, chunk_size, total_chunks, file_md5,
                   status, file_url, object_key, etag, created_at, updated_at, expires_at
            FROM upload_sessions
            ORDER BY created_at
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    /// Every received chunk as `(upload_id, chunk_index)`
    pub async fn received_chunks(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT upload_id, chunk_index FROM upload_chunks ORDER BY upload_id, chunk_index",
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}
