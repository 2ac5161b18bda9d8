//! Session Journal
//!
//! Durable record of upload sessions and the chunks they have received,
//! reloaded at startup so interrupted uploads can resume after a restart.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use super::types::{SessionStatus, UploadError, UploadSession};
use crate::db::UploadRepository;

/// Write-through store behind the session repository
#[async_trait::async_trait]
pub trait SessionJournal: Send + Sync {
    /// Store the full state of a session except its received chunks
    async fn save(&self, session: &UploadSession) -> Result<(), UploadError>;

    /// Record one received chunk
    async fn record_chunk(
        &self,
        id: Uuid,
        chunk_index: usize,
        status: SessionStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), UploadError>;

    async fn remove(&self, id: Uuid) -> Result<(), UploadError>;

    /// Every journaled session with its received chunks
    async fn load(&self) -> Result<Vec<UploadSession>, UploadError>;
}

/// Journal kept in the `upload_sessions` and `upload_chunks` tables
#[derive(Clone)]
pub struct SqliteSessionJournal {
    db: SqlitePool,
}

impl SqliteSessionJournal {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

fn journal_error(e: impl std::fmt::Display) -> UploadError {
    UploadError::StorageFailure(format!("session journal: {}", e))
}

#[async_trait::async_trait]
impl SessionJournal for SqliteSessionJournal {
    async fn save(&self, session: &UploadSession) -> Result<(), UploadError> {
        UploadRepository::new(&self.db)
            .upsert(session)
            .await
            .map_err(journal_error)
    }

    async fn record_chunk(
        &self,
        id: Uuid,
        chunk_index: usize,
        status: SessionStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        UploadRepository::new(&self.db)
            .record_chunk(id, chunk_index, status, expires_at)
            .await
            .map_err(journal_error)
    }

    async fn remove(&self, id: Uuid) -> Result<(), UploadError> {
        UploadRepository::new(&self.db)
            .delete(id)
            .await
            .map_err(journal_error)
    }

    async fn load(&self) -> Result<Vec<UploadSession>, UploadError> {
        let repo = UploadRepository::new(&self.db);
        let records = repo.all().await.map_err(journal_error)?;

        let mut received: HashMap<String, BTreeSet<usize>> = HashMap::new();
        for (upload_id, chunk_index) in repo.received_chunks().await.map_err(journal_error)? {
            received
                .entry(upload_id)
                .or_default()
                .insert(chunk_index.max(0) as usize);
        }

        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            let chunks = received.remove(&record.id).unwrap_or_default();
            match record.into_session(chunks) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable upload session"),
            }
        }

        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::upload::types::{ChunkPlan, StoredObject, UploadParams};
    use chrono::Duration;
    use tempfile::TempDir;

    async fn journal(dir: &TempDir) -> SqliteSessionJournal {
        let url = format!("sqlite://{}", dir.path().join("oss.db").display());
        SqliteSessionJournal::new(create_pool(&url).await.unwrap())
    }

    fn session(file_size: u64) -> UploadSession {
        let params = UploadParams {
            file_name: "archive.tar".to_string(),
            file_size,
            file_type: "application/x-tar".to_string(),
            chunk_size: 10,
            file_md5: None,
        };
        let plan = ChunkPlan::new(params.file_size, params.chunk_size).unwrap();
        UploadSession::new(params, plan, Duration::hours(1))
    }

    #[tokio::test]
    async fn test_load_groups_chunks_by_session() {
        let temp_dir = TempDir::new().unwrap();
        let journal = journal(&temp_dir).await;

        let first = session(30);
        let second = session(15);
        journal.save(&first).await.unwrap();
        journal.save(&second).await.unwrap();
        for index in [2, 0] {
            journal
                .record_chunk(first.id, index, SessionStatus::InProgress, first.expires_at)
                .await
                .unwrap();
        }

        let mut loaded = journal.load().await.unwrap();
        loaded.sort_by_key(|s| s.total_chunks);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, second.id);
        assert_eq!(loaded[0].status, SessionStatus::Pending);
        assert_eq!(loaded[1].received_chunks, BTreeSet::from([0, 2]));
        assert_eq!(loaded[1].status, SessionStatus::InProgress);
    }

    #[tokio::test]
    async fn test_save_keeps_chunks_and_remove_drops_them() {
        let temp_dir = TempDir::new().unwrap();
        let journal = journal(&temp_dir).await;

        let mut session = session(20);
        journal.save(&session).await.unwrap();
        journal
            .record_chunk(session.id, 0, SessionStatus::InProgress, session.expires_at)
            .await
            .unwrap();

        let object = StoredObject {
            etag: "0123456789abcdef0123456789abcdef".to_string(),
            object_key: "2024/01/01/id/archive.tar".to_string(),
            file_url: "/files/2024/01/01/id/archive.tar".to_string(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            file_type: session.file_type.clone(),
            upload_id: session.id,
        };
        session.mark_completed(&object, Duration::hours(1));
        journal.save(&session).await.unwrap();

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded[0].status, SessionStatus::Completed);
        assert_eq!(loaded[0].file_url.as_deref(), Some(object.file_url.as_str()));
        assert_eq!(loaded[0].received_count(), 1);

        journal.remove(session.id).await.unwrap();
        assert!(journal.load().await.unwrap().is_empty());
    }
}
