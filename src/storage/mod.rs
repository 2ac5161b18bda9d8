//! Storage module for published objects
//!
//! Completed uploads are published here and served back under `/files`.
//! The local filesystem backend is used by the server; the in-memory
//! backend backs tests.

mod local;
mod memory;
mod types;

use std::path::Path;

pub use local::LocalObjectStorage;
pub use memory::MemoryObjectStorage;
pub use types::*;

/// Trait for object storage backends
#[async_trait::async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Publish the file at `source` under `key`, replacing any previous
    /// object. The source file is consumed.
    async fn put_file(
        &self,
        key: &str,
        source: &Path,
        content_type: &str,
    ) -> Result<ObjectMetadata, StorageError>;

    /// Open an object for reading
    async fn get_object(&self, key: &str) -> Result<StorageObject, StorageError>;

    /// Delete an object; deleting a missing object is not an error
    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;
}

/// Reject keys that could escape the storage root
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..");

    if invalid {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Guess a content type from a key's extension
pub fn guess_content_type(key: &str) -> String {
    mime_guess::from_path(key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Read a whole object into memory
#[cfg(test)]
pub(crate) async fn read_object(storage: &dyn ObjectStorage, key: &str) -> Result<Vec<u8>, StorageError> {
    use tokio::io::AsyncReadExt;

    let mut object = storage.get_object(key).await?;
    let mut data = Vec::new();
    object.reader.read_to_end(&mut data).await?;
    Ok(data)
}
