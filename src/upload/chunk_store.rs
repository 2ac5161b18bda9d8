//! Chunk Store
//!
//! Temporary storage for uploaded chunks before merge.
//! Chunks are keyed by (upload ID, chunk index) and released once the
//! session completes or expires.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::storage::StorageError;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Reserve space for a new upload
    async fn allocate(&self, upload_id: Uuid) -> Result<(), StorageError>;

    /// Store a chunk, replacing any previous bytes for the same index
    async fn put_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Get a chunk by upload and index
    async fn get_chunk(&self, upload_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, StorageError>;

    /// Delete all chunks for an upload, returning how many were removed
    async fn release(&self, upload_id: Uuid) -> Result<usize, StorageError>;

    /// Uploads that currently hold chunk space
    async fn allocated_uploads(&self) -> Result<Vec<Uuid>, StorageError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Chunk store with a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Arc::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with in-memory storage
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryChunkStorage::default()))
    }

    pub fn with_backend(backend: Arc<dyn ChunkStorage>) -> Self {
        Self { backend }
    }

    pub async fn allocate(&self, upload_id: Uuid) -> Result<(), StorageError> {
        self.backend.allocate(upload_id).await
    }

    pub async fn put_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.backend.put_chunk(upload_id, chunk_index, data).await?;

        tracing::debug!(
            upload_id = %upload_id,
            chunk_index = chunk_index,
            size = data.len(),
            "Stored chunk"
        );

        Ok(())
    }

    pub async fn get_chunk(&self, upload_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, StorageError> {
        self.backend.get_chunk(upload_id, chunk_index).await
    }

    pub async fn release(&self, upload_id: Uuid) -> Result<usize, StorageError> {
        self.backend.release(upload_id).await
    }

    pub async fn allocated_uploads(&self) -> Result<Vec<Uuid>, StorageError> {
        self.backend.allocated_uploads().await
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
///
/// Layout: `{base}/{upload_id}/{index:08}.chunk`
pub struct LocalChunkStorage {
    base_path: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn upload_dir(&self, upload_id: Uuid) -> PathBuf {
        self.base_path.join(upload_id.to_string())
    }

    fn chunk_path(&self, upload_id: Uuid, chunk_index: usize) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("{:08}.chunk", chunk_index))
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn allocate(&self, upload_id: Uuid) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(self.upload_dir(upload_id)).await?;
        Ok(())
    }

    async fn put_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let dir = self.upload_dir(upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        // Write beside the target and rename so a retried chunk replaces
        // the old bytes in one step
        let path = self.chunk_path(upload_id, chunk_index);
        let staging = dir.join(format!("{:08}.{}.part", chunk_index, Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&staging, data).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        Ok(())
    }

    async fn get_chunk(&self, upload_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, StorageError> {
        let path = self.chunk_path(upload_id, chunk_index);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound(
                format!("chunk {} of upload {}", chunk_index, upload_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, upload_id: Uuid) -> Result<usize, StorageError> {
        let dir = self.upload_dir(upload_id);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            tokio::fs::remove_file(entry.path()).await?;
            count += 1;
        }

        tokio::fs::remove_dir(&dir).await?;

        Ok(count)
    }

    async fn allocated_uploads(&self) -> Result<Vec<Uuid>, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            {
                ids.push(id);
            }
        }

        Ok(ids)
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory chunk storage
#[derive(Default)]
pub struct MemoryChunkStorage {
    uploads: Mutex<HashMap<Uuid, BTreeMap<usize, Vec<u8>>>>,
}

#[async_trait::async_trait]
impl ChunkStorage for MemoryChunkStorage {
    async fn allocate(&self, upload_id: Uuid) -> Result<(), StorageError> {
        self.uploads.lock().entry(upload_id).or_default();
        Ok(())
    }

    async fn put_chunk(
        &self,
        upload_id: Uuid,
        chunk_index: usize,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.uploads
            .lock()
            .entry(upload_id)
            .or_default()
            .insert(chunk_index, data.to_vec());
        Ok(())
    }

    async fn get_chunk(&self, upload_id: Uuid, chunk_index: usize) -> Result<Vec<u8>, StorageError> {
        self.uploads
            .lock()
            .get(&upload_id)
            .and_then(|chunks| chunks.get(&chunk_index))
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound(format!("chunk {} of upload {}", chunk_index, upload_id))
            })
    }

    async fn release(&self, upload_id: Uuid) -> Result<usize, StorageError> {
        Ok(self
            .uploads
            .lock()
            .remove(&upload_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0))
    }

    async fn allocated_uploads(&self) -> Result<Vec<Uuid>, StorageError> {
        Ok(self.uploads.lock().keys().copied().collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
