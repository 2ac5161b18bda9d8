//! Upload Coordinator
//!
//! Public face of the upload subsystem: init, accept chunk, status,
//! complete, and the expiry sweep that reclaims abandoned sessions.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use super::checksum_index::ChecksumIndex;
use super::chunk_store::ChunkStore;
use super::merge::MergeEngine;
use super::session::SessionRepository;
use super::types::{
    ChunkPlan, ChunkUploadResponse, InitRequest, SessionStatus, StatusResponse, UploadError,
    UploadSession, DEFAULT_MAX_CHUNKS, DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_SESSION_TTL_SECS,
};
use crate::storage::ObjectStorage;

/// Tunables of the upload subsystem
#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Idle time after which a session is reclaimed
    pub session_ttl: Duration,

    /// Largest file accepted at init
    pub max_file_size: u64,

    /// Most chunks one upload may be cut into
    pub max_chunks: usize,

    /// Largest chunk a client may declare; bounded by the request body limit
    pub max_chunk_size: u64,

    /// Prefix of published file URLs; empty for relative URLs
    pub public_base_url: String,

    /// Where files are assembled before publishing
    pub staging_dir: PathBuf,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_chunks: DEFAULT_MAX_CHUNKS,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            public_base_url: String::new(),
            staging_dir: std::env::temp_dir().join("oss-staging"),
        }
    }
}

/// Orchestrates sessions, chunk storage, merging and deduplication
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<UploadCoordinatorInner>,
}

struct UploadCoordinatorInner {
    sessions: SessionRepository,
    chunk_store: ChunkStore,
    checksum_index: Arc<dyn ChecksumIndex>,
    merge: MergeEngine,
    settings: UploadSettings,
}

impl UploadCoordinator {
    pub fn new(
        sessions: SessionRepository,
        chunk_store: ChunkStore,
        checksum_index: Arc<dyn ChecksumIndex>,
        objects: Arc<dyn ObjectStorage>,
        settings: UploadSettings,
    ) -> Self {
        let merge = MergeEngine::new(
            chunk_store.clone(),
            objects,
            Arc::clone(&checksum_index),
            settings.public_base_url.clone(),
            settings.staging_dir.clone(),
        );

        Self {
            inner: Arc::new(UploadCoordinatorInner {
                sessions,
                chunk_store,
                checksum_index,
                merge,
                settings,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.inner.sessions
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Start an upload, or satisfy it at once from an existing object
    pub async fn init(&self, request: &InitRequest) -> Result<UploadSession, UploadError> {
        let settings = &self.inner.settings;
        let params = request.validate(settings.max_file_size)?;
        let ttl = settings.session_ttl;

        if let Some(md5) = params.file_md5.clone() {
            if let Some(existing) = self.inner.checksum_index.lookup(&md5).await? {
                let session = UploadSession::instant(params, &existing, ttl);
                self.inner.checksum_index.record(&md5, &existing).await?;
                self.inner.sessions.persist(&session).await?;
                self.inner.sessions.insert(session.clone()).await;

                tracing::info!(
                    upload_id = %session.id,
                    file_md5 = %md5,
                    object_key = %existing.object_key,
                    "Duplicate file detected - instant upload"
                );

                return Ok(session);
            }
        }

        let plan = ChunkPlan::new(params.file_size, params.chunk_size)?;
        let largest_chunk = plan.expected_len(0).unwrap_or(0);
        if largest_chunk > settings.max_chunk_size {
            return Err(UploadError::InvalidArgument(format!(
                "chunk_size {} exceeds the maximum of {} bytes",
                largest_chunk, settings.max_chunk_size
            )));
        }
        if plan.total_chunks > settings.max_chunks {
            return Err(UploadError::InvalidArgument(format!(
                "{} chunks exceed the maximum of {}; use a chunk_size of at least {} bytes",
                plan.total_chunks,
                settings.max_chunks,
                params.file_size.div_ceil(settings.max_chunks as u64)
            )));
        }

        let session = UploadSession::new(params, plan, ttl);

        // Register before allocating so the orphan sweep never sees chunk
        // space without an owner
        self.inner.sessions.persist(&session).await?;
        self.inner.sessions.insert(session.clone()).await;
        if let Err(e) = self.inner.chunk_store.allocate(session.id).await {
            self.discard(session.id).await;
            return Err(e.into());
        }

        tracing::info!(
            upload_id = %session.id,
            file_name = %session.file_name,
            file_size = session.file_size,
            chunks = session.total_chunks,
            "Created upload session"
        );

        Ok(session)
    }

    /// Store one chunk of an upload
    pub async fn accept_chunk(
        &self,
        upload_id: &str,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<ChunkUploadResponse, UploadError> {
        let entry = self.inner.sessions.get_by_str(upload_id).await?;
        let _guard = entry.lock().await;
        let (id, expired, status, plan) =
            entry.read(|s| (s.id, s.is_expired(), s.status, s.plan()));

        if expired {
            return Err(UploadError::NotFound(format!("{} (expired)", upload_id)));
        }
        if status == SessionStatus::Completed {
            return Err(UploadError::InvalidArgument(format!(
                "upload {} is already completed",
                upload_id
            )));
        }

        let expected = plan.expected_len(chunk_index).ok_or_else(|| {
            UploadError::InvalidArgument(format!(
                "chunk index {} out of range 0..{}",
                chunk_index, plan.total_chunks
            ))
        })?;
        if data.len() as u64 != expected {
            return Err(UploadError::InvalidArgument(format!(
                "chunk {} size mismatch: expected {}, got {}",
                chunk_index,
                expected,
                data.len()
            )));
        }

        self.inner.chunk_store.put_chunk(id, chunk_index, data).await?;

        let ttl = self.inner.settings.session_ttl;
        self.inner
            .sessions
            .persist_chunk(id, chunk_index, status.on_chunk(), chrono::Utc::now() + ttl)
            .await?;

        let receipt = entry.update(|s| {
            s.record_chunk(chunk_index, ttl);
            ChunkUploadResponse {
                chunk_index,
                received_count: s.received_count(),
                total_chunks: s.total_chunks,
                progress: s.progress(),
            }
        });

        tracing::debug!(
            upload_id = %id,
            chunk_index = chunk_index,
            chunks_received = receipt.received_count,
            total_chunks = receipt.total_chunks,
            progress = receipt.progress,
            "Chunk uploaded"
        );

        Ok(receipt)
    }

    /// Current state of an upload
    pub async fn status(&self, upload_id: &str) -> Result<StatusResponse, UploadError> {
        let entry = self.inner.sessions.get_by_str(upload_id).await?;
        entry.read(|s| {
            if s.is_expired() {
                return Err(UploadError::NotFound(format!("{} (expired)", upload_id)));
            }
            Ok(StatusResponse::from(s))
        })
    }

    /// Merge all chunks and publish the file
    pub async fn complete(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        let entry = self.inner.sessions.get_by_str(upload_id).await?;
        let _guard = entry.lock().await;
        let (expired, status, received, total) =
            entry.read(|s| (s.is_expired(), s.status, s.received_count(), s.total_chunks));

        if expired {
            return Err(UploadError::NotFound(format!("{} (expired)", upload_id)));
        }
        if status == SessionStatus::Completed {
            return Ok(entry.snapshot());
        }
        if received != total {
            return Err(UploadError::IncompleteUpload { received, total });
        }

        let result = self
            .inner
            .merge
            .complete(&entry, self.inner.settings.session_ttl)
            .await;

        // Journal the new status; the in-memory state stays authoritative
        let changed = match &result {
            Ok(completed) => Some(completed.clone()),
            Err(UploadError::IntegrityMismatch { .. }) => Some(entry.snapshot()),
            Err(_) => None,
        };
        if let Some(session) = changed {
            if let Err(e) = self.inner.sessions.persist(&session).await {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to journal session status");
            }
        }

        result
    }

    /// Unregister a session and drop it from the journal
    async fn discard(&self, id: Uuid) -> Option<UploadSession> {
        let removed = self.inner.sessions.remove(id).await;
        if let Err(e) = self.inner.sessions.forget(id).await {
            tracing::warn!(upload_id = %id, error = %e, "Failed to drop session from journal");
        }
        removed
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Remove expired sessions and release their chunks
    ///
    /// Returns the number of sessions removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut count = 0;

        for id in self.inner.sessions.expired_ids().await {
            let Ok(entry) = self.inner.sessions.get(id).await else {
                continue;
            };

            // Wait out any in-flight writer, then re-check
            let _guard = entry.lock().await;
            if !entry.read(|s| s.is_expired()) {
                continue;
            }

            if let Some(session) = self.discard(id).await {
                if let Err(e) = self.inner.chunk_store.release(id).await {
                    tracing::warn!(upload_id = %id, error = %e, "Failed to release chunks of expired session");
                }
                tracing::debug!(
                    upload_id = %id,
                    file_name = %session.file_name,
                    status = ?session.status,
                    "Cleaned up expired session"
                );
                count += 1;
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Cleaned up expired upload sessions");
        }

        count
    }

    /// Release chunk space that no registered session owns
    ///
    /// Allocated space is listed before the registry is consulted; sessions
    /// are registered before their space is allocated, so an upload created
    /// during the sweep is never mistaken for an orphan.
    pub async fn sweep_orphaned_chunks(&self) -> usize {
        let allocated = match self.inner.chunk_store.allocated_uploads().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list allocated chunk space");
                return 0;
            }
        };

        let mut count = 0;
        for id in allocated {
            if self.inner.sessions.contains(id).await {
                continue;
            }
            match self.inner.chunk_store.release(id).await {
                Ok(chunks) => {
                    tracing::debug!(upload_id = %id, chunks = chunks, "Released orphaned chunks");
                    count += 1;
                }
                Err(e) => tracing::warn!(upload_id = %id, error = %e, "Failed to release orphaned chunks"),
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Swept orphaned chunk directories");
        }

        count
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.cleanup_expired().await;
                self.sweep_orphaned_chunks().await;
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
