//! Local filesystem object storage

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{guess_content_type, validate_key, ObjectMetadata, ObjectStorage, StorageError, StorageObject};

/// Stores objects as plain files under a root directory
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait::async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        content_type: &str,
    ) -> Result<ObjectMetadata, StorageError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Same filesystem: a rename publishes the file in one step
        if tokio::fs::rename(source, &path).await.is_err() {
            // Otherwise copy beside the target, then rename so readers never
            // observe a partial object
            let staging = path.with_file_name(format!(".staging-{}", Uuid::new_v4()));
            if let Err(e) = tokio::fs::copy(source, &staging).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            if let Err(e) = tokio::fs::rename(&staging, &path).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            let _ = tokio::fs::remove_file(source).await;
        }

        let size = tokio::fs::metadata(&path).await?.len();
        tracing::debug!(key = %key, size = size, "Stored object");

        Ok(ObjectMetadata {
            key: key.to_string(),
            size,
            last_modified: Some(Utc::now()),
            content_type: Some(content_type.to_string()),
        })
    }

    async fn get_object(&self, key: &str) -> Result<StorageObject, StorageError> {
        let path = self.object_path(key)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(StorageObject {
            metadata: ObjectMetadata {
                key: key.to_string(),
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
                content_type: Some(guess_content_type(key)),
            },
            reader: Box::new(file),
        })
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        let path = self.object_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
