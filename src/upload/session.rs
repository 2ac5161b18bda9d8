//! Upload Session Repository
//!
//! Registry of upload sessions with:
//! - One writer at a time per session (chunk accept, complete)
//! - Lock-free-of-writers status reads through a short snapshot lock
//! - Expiry bookkeeping for the cleanup task
//! - Optional write-through to a journal so sessions survive restarts

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

use super::journal::SessionJournal;
use super::types::{SessionStatus, UploadError, UploadSession};

// ============================================================================
// Session Entry
// ============================================================================

/// A registered session and its locks
pub struct SessionEntry {
    /// Serializes mutations; held across storage I/O
    writer: Mutex<()>,

    /// Current state; only held for copies and in-place updates
    state: parking_lot::RwLock<UploadSession>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            writer: Mutex::new(()),
            state: parking_lot::RwLock::new(session),
        }
    }

    /// Acquire exclusive write access to this session
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> UploadSession {
        self.state.read().clone()
    }

    /// Inspect the current state without copying it
    pub fn read<R>(&self, f: impl FnOnce(&UploadSession) -> R) -> R {
        f(&self.state.read())
    }

    /// Apply an in-place update to the state
    pub fn update<R>(&self, f: impl FnOnce(&mut UploadSession) -> R) -> R {
        f(&mut self.state.write())
    }
}

// ============================================================================
// Session Repository
// ============================================================================

/// Explicit registry of upload sessions
#[derive(Clone, Default)]
pub struct SessionRepository {
    inner: Arc<SessionRepositoryInner>,
}

#[derive(Default)]
struct SessionRepositoryInner {
    /// Sessions indexed by upload ID
    sessions: RwLock<HashMap<Uuid, Arc<SessionEntry>>>,

    /// Durable copy of the registry, if any
    journal: Option<Arc<dyn SessionJournal>>,
}

impl SessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repository that writes every change through to `journal`
    pub fn with_journal(journal: Arc<dyn SessionJournal>) -> Self {
        Self {
            inner: Arc::new(SessionRepositoryInner {
                sessions: RwLock::new(HashMap::new()),
                journal: Some(journal),
            }),
        }
    }

    /// Reload journaled sessions into memory, returning how many were loaded
    pub async fn restore(&self) -> Result<usize, UploadError> {
        let Some(journal) = &self.inner.journal else {
            return Ok(0);
        };

        let restored = journal.load().await?;
        let count = restored.len();
        let mut sessions = self.inner.sessions.write().await;
        for session in restored {
            sessions.insert(session.id, Arc::new(SessionEntry::new(session)));
        }

        tracing::info!(count = count, "Restored upload sessions");
        Ok(count)
    }

    /// Write the full state of a session to the journal
    pub async fn persist(&self, session: &UploadSession) -> Result<(), UploadError> {
        match &self.inner.journal {
            Some(journal) => journal.save(session).await,
            None => Ok(()),
        }
    }

    /// Journal one received chunk and the status it moves the session to
    pub async fn persist_chunk(
        &self,
        id: Uuid,
        chunk_index: usize,
        status: SessionStatus,
        expires_at: DateTime<Utc>,
    ) -> Result<(), UploadError> {
        match &self.inner.journal {
            Some(journal) => journal.record_chunk(id, chunk_index, status, expires_at).await,
            None => Ok(()),
        }
    }

    /// Drop a session from the journal
    pub async fn forget(&self, id: Uuid) -> Result<(), UploadError> {
        match &self.inner.journal {
            Some(journal) => journal.remove(id).await,
            None => Ok(()),
        }
    }

    /// Register a session
    pub async fn insert(&self, session: UploadSession) -> Arc<SessionEntry> {
        let id = session.id;
        let entry = Arc::new(SessionEntry::new(session));
        self.inner
            .sessions
            .write()
            .await
            .insert(id, Arc::clone(&entry));
        entry
    }

    /// Get a session by ID
    pub async fn get(&self, id: Uuid) -> Result<Arc<SessionEntry>, UploadError> {
        self.inner
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| UploadError::NotFound(id.to_string()))
    }

    /// Get a session by string ID
    pub async fn get_by_str(&self, id: &str) -> Result<Arc<SessionEntry>, UploadError> {
        let uuid = parse_upload_id(id)?;
        self.get(uuid).await
    }

    /// Remove a session, returning its last state
    pub async fn remove(&self, id: Uuid) -> Option<UploadSession> {
        self.inner
            .sessions
            .write()
            .await
            .remove(&id)
            .map(|entry| entry.snapshot())
    }

    /// IDs of sessions whose expiry has passed
    pub async fn expired_ids(&self) -> Vec<Uuid> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state.read().is_expired())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.inner.sessions.read().await.contains_key(&id)
    }

    /// Get session count
    pub async fn len(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.sessions.read().await.is_empty()
    }

    /// Sessions still waiting for chunks or a merge
    pub async fn active_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|entry| !entry.state.read().status.is_terminal())
            .count()
    }
}

/// Parse an upload ID; malformed IDs are unknown IDs
pub fn parse_upload_id(id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(id).map_err(|_| UploadError::NotFound(id.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
