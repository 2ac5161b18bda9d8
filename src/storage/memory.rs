//! In-memory object storage

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use super::{validate_key, ObjectMetadata, ObjectStorage, StorageError, StorageObject};

/// Keeps objects in a map; used by tests and benchmarks
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: RwLock<HashMap<String, (ObjectMetadata, Arc<Vec<u8>>)>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        content_type: &str,
    ) -> Result<ObjectMetadata, StorageError> {
        validate_key(key)?;
        let data = tokio::fs::read(source).await?;
        tokio::fs::remove_file(source).await?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            size: data.len() as u64,
            last_modified: Some(Utc::now()),
            content_type: Some(content_type.to_string()),
        };
        self.objects
            .write()
            .insert(key.to_string(), (metadata.clone(), Arc::new(data)));
        Ok(metadata)
    }

    async fn get_object(&self, key: &str) -> Result<StorageObject, StorageError> {
        validate_key(key)?;
        let (metadata, data) = self
            .objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        Ok(StorageObject {
            metadata,
            reader: Box::new(Cursor::new(data.to_vec())),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.objects.write().remove(key);
        Ok(())
    }
}
