//! Checksum Index
//!
//! Maps a whole-file MD5 to the object it was published as.
//! Enables instant uploads for files the server already holds.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use super::types::{StoredObject, UploadError};
use crate::db::ObjectRepository;

// ============================================================================
// Checksum Index Trait
// ============================================================================

/// Content hash -> published object lookup
#[async_trait::async_trait]
pub trait ChecksumIndex: Send + Sync {
    /// Find the object published for `md5`
    async fn lookup(&self, md5: &str) -> Result<Option<StoredObject>, UploadError>;

    /// Remember `object` as the published copy of `md5`; last writer wins
    async fn record(&self, md5: &str, object: &StoredObject) -> Result<(), UploadError>;
}

// ============================================================================
// In-Memory Index
// ============================================================================

/// Lock-protected in-memory index
#[derive(Default)]
pub struct MemoryChecksumIndex {
    entries: RwLock<HashMap<String, StoredObject>>,
}

impl MemoryChecksumIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait::async_trait]
impl ChecksumIndex for MemoryChecksumIndex {
    async fn lookup(&self, md5: &str) -> Result<Option<StoredObject>, UploadError> {
        Ok(self.entries.read().await.get(md5).cloned())
    }

    async fn record(&self, md5: &str, object: &StoredObject) -> Result<(), UploadError> {
        self.entries
            .write()
            .await
            .insert(md5.to_string(), object.clone());
        Ok(())
    }
}

// ============================================================================
// SQLite Index
// ============================================================================

/// SQLite-backed index with a read-through cache
#[derive(Clone)]
pub struct SqliteChecksumIndex {
    inner: Arc<SqliteChecksumIndexInner>,
}

struct SqliteChecksumIndexInner {
    /// Database pool for hash lookups
    db: SqlitePool,

    /// In-memory cache of file hashes -> objects
    cache: RwLock<HashMap<String, StoredObject>>,
}

impl SqliteChecksumIndex {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            inner: Arc::new(SqliteChecksumIndexInner {
                db,
                cache: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Preload the cache with the most recently published objects
    pub async fn preload(&self, limit: usize) -> Result<usize, UploadError> {
        let records = ObjectRepository::new(&self.inner.db)
            .recent(limit)
            .await
            .map_err(|e| UploadError::StorageFailure(e.to_string()))?;

        let mut cache = self.inner.cache.write().await;
        let mut count = 0;
        for record in records {
            match StoredObject::try_from(record) {
                Ok(object) => {
                    cache.insert(object.etag.clone(), object);
                    count += 1;
                }
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable object record"),
            }
        }

        tracing::info!(count = count, "Preloaded checksum index cache");
        Ok(count)
    }

    /// Clear the cache
    pub async fn clear_cache(&self) {
        self.inner.cache.write().await.clear();
        tracing::debug!("Cleared checksum index cache");
    }
}

#[async_trait::async_trait]
impl ChecksumIndex for SqliteChecksumIndex {
    async fn lookup(&self, md5: &str) -> Result<Option<StoredObject>, UploadError> {
        // Check cache first
        {
            let cache = self.inner.cache.read().await;
            if let Some(object) = cache.get(md5) {
                tracing::debug!(file_md5 = %md5, object_key = %object.object_key, "Checksum found in cache");
                return Ok(Some(object.clone()));
            }
        }

        let record = ObjectRepository::new(&self.inner.db)
            .get_by_etag(md5)
            .await
            .map_err(|e| UploadError::StorageFailure(e.to_string()))?;

        let Some(record) = record else {
            return Ok(None);
        };

        let object =
            StoredObject::try_from(record).map_err(|e| UploadError::StorageFailure(e.to_string()))?;

        self.inner
            .cache
            .write()
            .await
            .insert(md5.to_string(), object.clone());

        Ok(Some(object))
    }

    async fn record(&self, md5: &str, object: &StoredObject) -> Result<(), UploadError> {
        ObjectRepository::new(&self.inner.db)
            .upsert(object)
            .await
            .map_err(|e| UploadError::StorageFailure(e.to_string()))?;

        self.inner
            .cache
            .write()
            .await
            .insert(md5.to_string(), object.clone());

        tracing::info!(
            file_md5 = %md5,
            object_key = %object.object_key,
            "Registered file checksum"
        );

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn object(md5: &str, url: &str) -> StoredObject {
        StoredObject {
            etag: md5.to_string(),
            object_key: "2024/01/01/id/a.bin".to_string(),
            file_url: url.to_string(),
            file_name: "a.bin".to_string(),
            file_size: 10,
            file_type: "application/octet-stream".to_string(),
            upload_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_memory_index_last_writer_wins() {
        let index = MemoryChecksumIndex::new();
        assert!(index.lookup("m").await.unwrap().is_none());

        index.record("m", &object("m", "/files/1")).await.unwrap();
        index.record("m", &object("m", "/files/2")).await.unwrap();

        assert_eq!(index.len().await, 1);
        assert_eq!(index.lookup("m").await.unwrap().unwrap().file_url, "/files/2");
    }

    #[tokio::test]
    async fn test_sqlite_index_survives_cache_clear() {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp_dir.path().join("oss.db").display());
        let pool = create_pool(&url).await.unwrap();

        let index = SqliteChecksumIndex::new(pool.clone());
        index.record("abc", &object("abc", "/files/x")).await.unwrap();
        index.clear_cache().await;

        let found = index.lookup("abc").await.unwrap().unwrap();
        assert_eq!(found.file_url, "/files/x");
        assert!(index.lookup("missing").await.unwrap().is_none());

        let fresh = SqliteChecksumIndex::new(pool);
        assert_eq!(fresh.preload(100).await.unwrap(), 1);
    }
}
