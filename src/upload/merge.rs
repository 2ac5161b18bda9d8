//! Merge Engine
//!
//! Turns a fully received session into a published object:
//! stream chunks in index order into a staging file while hashing them,
//! verify the MD5, publish, index the checksum, then release the chunk
//! space. Either every step commits or the session is left as it was.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use md5::{Digest, Md5};
use tokio::io::AsyncWriteExt;

use super::checksum_index::ChecksumIndex;
use super::chunk_store::ChunkStore;
use super::session::SessionEntry;
use super::types::{StoredObject, UploadError, UploadSession};
use crate::storage::{guess_content_type, ObjectStorage, StorageError};

/// Assembles and publishes completed uploads
#[derive(Clone)]
pub struct MergeEngine {
    chunk_store: ChunkStore,
    objects: Arc<dyn ObjectStorage>,
    checksum_index: Arc<dyn ChecksumIndex>,
    public_base_url: String,
    staging_dir: PathBuf,
}

/// An assembled file waiting in the staging directory
#[derive(Debug)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
}

impl AssembledFile {
    /// Delete the staged file if it is still there
    async fn discard(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove staged file"),
        }
    }
}

impl MergeEngine {
    pub fn new(
        chunk_store: ChunkStore,
        objects: Arc<dyn ObjectStorage>,
        checksum_index: Arc<dyn ChecksumIndex>,
        public_base_url: impl Into<String>,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            chunk_store,
            objects,
            checksum_index,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            staging_dir,
        }
    }

    /// Concatenate all chunks of `session` in ascending index order into a
    /// staging file, one chunk in memory at a time
    pub async fn assemble(&self, session: &UploadSession) -> Result<AssembledFile, UploadError> {
        let path = self.staging_dir.join(format!("{}.merge", session.id));

        match self.write_chunks(session, &path).await {
            Ok(assembled) => Ok(assembled),
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    async fn write_chunks(&self, session: &UploadSession, path: &Path) -> Result<AssembledFile, UploadError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(StorageError::from)?;
        let mut file = tokio::fs::File::create(path).await.map_err(StorageError::from)?;

        let mut hasher = Md5::new();
        let mut size = 0u64;
        for index in 0..session.total_chunks {
            let chunk = self.chunk_store.get_chunk(session.id, index).await?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(StorageError::from)?;
            size += chunk.len() as u64;
        }
        file.sync_all().await.map_err(StorageError::from)?;

        if size != session.file_size {
            return Err(UploadError::StorageFailure(format!(
                "assembled {} bytes, expected {}",
                size, session.file_size
            )));
        }

        Ok(AssembledFile {
            path: path.to_path_buf(),
            size,
            md5: hex::encode(hasher.finalize()),
        })
    }

    /// Merge and publish the session held by `entry`
    ///
    /// The caller must hold `entry.lock()` and must have checked that every
    /// chunk has been received.
    pub async fn complete(
        &self,
        entry: &SessionEntry,
        ttl: Duration,
    ) -> Result<UploadSession, UploadError> {
        let session = entry.snapshot();

        tracing::info!(
            upload_id = %session.id,
            file_name = %session.file_name,
            chunks = session.total_chunks,
            "Assembling file from chunks"
        );

        let assembled = self.assemble(&session).await?;

        if let Some(expected) = &session.file_md5 {
            if *expected != assembled.md5 {
                assembled.discard().await;
                entry.update(|s| s.mark_failed(ttl));
                tracing::warn!(
                    upload_id = %session.id,
                    expected = %expected,
                    actual = %assembled.md5,
                    "Assembled file failed checksum verification"
                );
                return Err(UploadError::IntegrityMismatch {
                    expected: expected.clone(),
                    actual: assembled.md5,
                });
            }
        }

        let object = self.describe(&session, &assembled.md5);
        let content_type = if session.file_type.is_empty() {
            guess_content_type(&session.file_name)
        } else {
            session.file_type.clone()
        };

        if let Err(e) = self
            .objects
            .put_file(&object.object_key, &assembled.path, &content_type)
            .await
        {
            assembled.discard().await;
            return Err(e.into());
        }

        if let Err(e) = self.checksum_index.record(&object.etag, &object).await {
            // Roll back the publish so the session stays retryable
            if let Err(cleanup) = self.objects.delete_object(&object.object_key).await {
                tracing::error!(
                    object_key = %object.object_key,
                    error = %cleanup,
                    "Failed to remove object after index failure"
                );
            }
            return Err(e);
        }

        let completed = entry.update(|s| {
            s.mark_completed(&object, ttl);
            s.clone()
        });

        match self.chunk_store.release(session.id).await {
            Ok(count) => tracing::debug!(upload_id = %session.id, chunks = count, "Released chunks"),
            Err(e) => tracing::warn!(upload_id = %session.id, error = %e, "Failed to release chunks"),
        }

        tracing::info!(
            upload_id = %session.id,
            object_key = %object.object_key,
            etag = %object.etag,
            size = assembled.size,
            "File stored successfully"
        );

        Ok(completed)
    }

    /// Storage key and public URL of the object a session publishes
    fn describe(&self, session: &UploadSession, md5: &str) -> StoredObject {
        let file_name = sanitize_file_name(&session.file_name);
        let prefix = format!("{}/{}", Utc::now().format("%Y/%m/%d"), session.id);
        let object_key = format!("{}/{}", prefix, file_name);
        let file_url = format!(
            "{}/files/{}/{}",
            self.public_base_url,
            prefix,
            urlencoding::encode(&file_name)
        );

        StoredObject {
            etag: md5.to_string(),
            object_key,
            file_url,
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            file_type: session.file_type.clone(),
            upload_id: session.id,
        }
    }
}

/// Make a client file name safe to use as one key segment
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "file".to_string(),
        _ => cleaned,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{read_object, MemoryObjectStorage};
    use crate::upload::checksum_index::MemoryChecksumIndex;
    use crate::upload::session::SessionRepository;
    use crate::upload::types::{ChunkPlan, SessionStatus, UploadParams};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn md5_hex(data: &[u8]) -> String {
        hex::encode(Md5::digest(data))
    }

    /// Index whose next `record` fails once when armed
    #[derive(Default)]
    struct FlakyIndex {
        inner: MemoryChecksumIndex,
        fail_next: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ChecksumIndex for FlakyIndex {
        async fn lookup(&self, md5: &str) -> Result<Option<StoredObject>, UploadError> {
            self.inner.lookup(md5).await
        }

        async fn record(&self, md5: &str, object: &StoredObject) -> Result<(), UploadError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(UploadError::StorageFailure("index unavailable".into()));
            }
            self.inner.record(md5, object).await
        }
    }

    struct Fixture {
        engine: MergeEngine,
        chunks: ChunkStore,
        objects: Arc<MemoryObjectStorage>,
        index: Arc<FlakyIndex>,
        sessions: SessionRepository,
        staging: TempDir,
    }

    fn fixture() -> Fixture {
        let chunks = ChunkStore::in_memory();
        let objects = Arc::new(MemoryObjectStorage::new());
        let index = Arc::new(FlakyIndex::default());
        let staging = TempDir::new().unwrap();
        let engine = MergeEngine::new(
            chunks.clone(),
            objects.clone(),
            index.clone(),
            "http://cdn.test/",
            staging.path().join("merge"),
        );
        Fixture {
            engine,
            chunks,
            objects,
            index,
            sessions: SessionRepository::new(),
            staging,
        }
    }

    fn staged_files(f: &Fixture) -> usize {
        std::fs::read_dir(f.staging.path().join("merge"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    async fn received_session(f: &Fixture, data: &[u8], chunk_size: u64, md5: Option<String>) -> Arc<SessionEntry> {
        let params = UploadParams {
            file_name: "hello world.txt".to_string(),
            file_size: data.len() as u64,
            file_type: "text/plain".to_string(),
            chunk_size,
            file_md5: md5,
        };
        let plan = ChunkPlan::new(params.file_size, params.chunk_size).unwrap();
        let entry = f.sessions.insert(UploadSession::new(params, plan, Duration::hours(1))).await;
        let id = entry.read(|s| s.id);

        // Deliver in reverse order
        for (index, chunk) in data.chunks(chunk_size as usize).enumerate().rev() {
            f.chunks.put_chunk(id, index, chunk).await.unwrap();
            entry.update(|s| s.record_chunk(index, Duration::hours(1)));
        }
        entry
    }

    #[tokio::test]
    async fn test_merge_orders_chunks_and_publishes() {
        let f = fixture();
        let data = b"HelloSwiftStreamTestFile".repeat(10);
        let entry = received_session(&f, &data, 7, Some(md5_hex(&data))).await;

        let completed = f.engine.complete(&entry, Duration::hours(1)).await.unwrap();

        assert_eq!(completed.status, SessionStatus::Completed);
        let key = completed.object_key.clone().unwrap();
        assert!(key.ends_with("/hello world.txt"));
        let url = completed.file_url.clone().unwrap();
        assert!(url.starts_with("http://cdn.test/files/"));
        assert!(url.ends_with("/hello%20world.txt"));

        assert_eq!(read_object(f.objects.as_ref(), &key).await.unwrap(), data);

        let indexed = f.index.lookup(&md5_hex(&data)).await.unwrap().unwrap();
        assert_eq!(indexed.file_url, url);
        assert!(f.chunks.allocated_uploads().await.unwrap().is_empty());
        assert_eq!(staged_files(&f), 0);
    }

    #[tokio::test]
    async fn test_assemble_streams_into_staging_file() {
        let f = fixture();
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let entry = received_session(&f, &data, 1_000, None).await;

        let assembled = f.engine.assemble(&entry.snapshot()).await.unwrap();

        assert_eq!(assembled.size, data.len() as u64);
        assert_eq!(assembled.md5, md5_hex(&data));
        assert!(assembled.path.starts_with(f.staging.path()));
        assert_eq!(std::fs::read(&assembled.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_marks_failed() {
        let f = fixture();
        let data = b"0123456789".to_vec();
        let entry = received_session(&f, &data, 4, Some(md5_hex(b"something else"))).await;

        let err = f.engine.complete(&entry, Duration::hours(1)).await.unwrap_err();

        assert!(matches!(err, UploadError::IntegrityMismatch { .. }));
        assert_eq!(entry.read(|s| s.status), SessionStatus::Failed);
        assert!(entry.read(|s| s.file_url.is_none()));
        assert!(f.objects.is_empty());
        assert_eq!(f.index.inner.len().await, 0);
        assert_eq!(staged_files(&f), 0);
        // Chunks are kept so the client can resubmit and retry
        assert_eq!(f.chunks.allocated_uploads().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_bytes_leave_session_unchanged() {
        let f = fixture();
        let data = b"abcdefgh".to_vec();
        let entry = received_session(&f, &data, 4, None).await;
        f.chunks.release(entry.read(|s| s.id)).await.unwrap();

        let err = f.engine.complete(&entry, Duration::hours(1)).await.unwrap_err();

        assert!(matches!(err, UploadError::StorageFailure(_)));
        assert_eq!(entry.read(|s| s.status), SessionStatus::InProgress);
        assert_eq!(staged_files(&f), 0);
    }

    #[tokio::test]
    async fn test_index_failure_rolls_back_publish() {
        let f = fixture();
        let data = b"rollback me please".to_vec();
        let entry = received_session(&f, &data, 5, Some(md5_hex(&data))).await;
        f.index.fail_next.store(true, Ordering::SeqCst);

        let err = f.engine.complete(&entry, Duration::hours(1)).await.unwrap_err();

        assert!(matches!(err, UploadError::StorageFailure(_)));
        assert!(f.objects.is_empty());
        assert_eq!(entry.read(|s| s.status), SessionStatus::InProgress);
        assert!(entry.read(|s| s.file_url.is_none()));
        assert_eq!(f.chunks.allocated_uploads().await.unwrap().len(), 1);
        assert_eq!(f.index.inner.len().await, 0);

        let completed = f.engine.complete(&entry, Duration::hours(1)).await.unwrap();
        assert_eq!(completed.status, SessionStatus::Completed);
        let key = completed.object_key.unwrap();
        assert_eq!(read_object(f.objects.as_ref(), &key).await.unwrap(), data);
        assert_eq!(f.index.inner.len().await, 1);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("  "), "file");
    }
}
