//! Upload types for the chunked upload protocol

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Session expiry time: 24 hours after the last activity
pub const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// Maximum file size: 10GB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Most chunks a single upload may be cut into
pub const DEFAULT_MAX_CHUNKS: usize = 10_000;

/// Largest chunk accepted: 50MB
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Most missing indices listed in a status response
pub const MISSING_CHUNKS_LIMIT: usize = 1_000;

/// Length of a hex-encoded MD5 digest
const MD5_HEX_LEN: usize = 32;

// ============================================================================
// Init Types
// ============================================================================

/// Request to initiate a chunked upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: i64,

    /// MIME type of the file
    #[serde(default)]
    pub file_type: String,

    /// Size of every chunk except possibly the last
    pub chunk_size: i64,

    /// MD5 of the complete file, enables instant upload
    #[serde(default)]
    pub file_md5: Option<String>,
}

impl InitRequest {
    /// Validate the request and normalize it into upload parameters
    pub fn validate(&self, max_file_size: u64) -> Result<UploadParams, UploadError> {
        let file_name = self.file_name.trim();
        if file_name.is_empty() {
            return Err(UploadError::InvalidArgument("file_name is required".into()));
        }
        if self.file_size <= 0 {
            return Err(UploadError::InvalidArgument(format!(
                "file_size must be positive, got {}",
                self.file_size
            )));
        }
        if self.chunk_size <= 0 {
            return Err(UploadError::InvalidArgument(format!(
                "chunk_size must be positive, got {}",
                self.chunk_size
            )));
        }

        let file_size = self.file_size as u64;
        if file_size > max_file_size {
            return Err(UploadError::InvalidArgument(format!(
                "file_size {} exceeds the maximum of {} bytes",
                file_size, max_file_size
            )));
        }

        Ok(UploadParams {
            file_name: file_name.to_string(),
            file_size,
            file_type: self.file_type.trim().to_string(),
            chunk_size: self.chunk_size as u64,
            file_md5: normalize_md5(self.file_md5.as_deref())?,
        })
    }
}

/// Validated parameters of a new upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadParams {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub chunk_size: u64,
    pub file_md5: Option<String>,
}

/// Response to an init request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    /// Upload session ID
    pub upload_id: String,

    /// Number of chunks to upload; 0 means the file already exists
    pub chunk_count: usize,

    /// Whether the upload was satisfied by an existing object
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub instant_upload: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_key: Option<String>,
}

impl From<&UploadSession> for InitResponse {
    fn from(session: &UploadSession) -> Self {
        let instant_upload = session.status == SessionStatus::Completed;
        Self {
            upload_id: session.id.to_string(),
            chunk_count: session.total_chunks,
            instant_upload,
            file_url: session.file_url.clone(),
            object_key: session.object_key.clone(),
        }
    }
}

// ============================================================================
// Chunk Upload Types
// ============================================================================

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// Chunk index that was stored
    pub chunk_index: usize,

    /// Number of distinct chunks received so far
    pub received_count: usize,

    /// Total chunks expected
    pub total_chunks: usize,

    /// Integer upload percentage
    pub progress: u8,
}

// ============================================================================
// Complete Types
// ============================================================================

/// Response after completing an upload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub status: SessionStatus,
    pub file_url: String,
    pub file_size: u64,
    pub file_name: String,
    pub object_key: String,
    pub etag: String,
}

impl From<&UploadSession> for CompleteResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            status: session.status,
            file_url: session.file_url.clone().unwrap_or_default(),
            file_size: session.file_size,
            file_name: session.file_name.clone(),
            object_key: session.object_key.clone().unwrap_or_default(),
            etag: session.etag.clone().unwrap_or_default(),
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

/// Snapshot of an upload session returned to polling clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub upload_id: String,
    pub status: SessionStatus,
    pub progress: u8,
    pub received_count: usize,
    pub total_chunks: usize,
    /// Number of chunks not yet received
    pub missing_count: usize,
    /// Lowest missing indices, at most `MISSING_CHUNKS_LIMIT`
    pub missing_chunks: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

impl From<&UploadSession> for StatusResponse {
    fn from(session: &UploadSession) -> Self {
        Self {
            upload_id: session.id.to_string(),
            status: session.status,
            progress: session.progress(),
            received_count: session.received_count(),
            total_chunks: session.total_chunks,
            missing_count: session.total_chunks - session.received_count(),
            missing_chunks: session.missing_chunks(MISSING_CHUNKS_LIMIT),
            file_url: session.file_url.clone(),
        }
    }
}

// ============================================================================
// Chunk Plan
// ============================================================================

/// How a file of `file_size` bytes is cut into `chunk_size` pieces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if file_size == 0 || chunk_size == 0 {
            return Err(UploadError::InvalidArgument(
                "file_size and chunk_size must be positive".into(),
            ));
        }

        Ok(Self {
            file_size,
            chunk_size,
            total_chunks: file_size.div_ceil(chunk_size) as usize,
        })
    }

    /// Expected byte length of the chunk at `index`, `None` if out of range
    pub fn expected_len(&self, index: usize) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        if index + 1 < self.total_chunks {
            return Some(self.chunk_size);
        }
        Some(self.file_size - self.chunk_size * (self.total_chunks as u64 - 1))
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Upload session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Unique session ID
    pub id: Uuid,

    /// Original file name
    pub file_name: String,

    /// Total file size in bytes
    pub file_size: u64,

    /// MIME type as declared by the client
    pub file_type: String,

    /// Chunk size used for this upload
    pub chunk_size: u64,

    /// Number of chunks the file is cut into (0 for instant uploads)
    pub total_chunks: usize,

    /// Client-declared MD5 of the complete file
    pub file_md5: Option<String>,

    /// Indices of chunks that have been received
    pub received_chunks: BTreeSet<usize>,

    /// Current status
    pub status: SessionStatus,

    /// Public URL of the published file, set once completed
    pub file_url: Option<String>,

    /// Storage key of the published file, set once completed
    pub object_key: Option<String>,

    /// MD5 of the published file, set once completed
    pub etag: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// Create a new session waiting for its first chunk
    pub fn new(params: UploadParams, plan: ChunkPlan, ttl: Duration) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            file_name: params.file_name,
            file_size: params.file_size,
            file_type: params.file_type,
            chunk_size: params.chunk_size,
            total_chunks: plan.total_chunks,
            file_md5: params.file_md5,
            received_chunks: BTreeSet::new(),
            status: SessionStatus::Pending,
            file_url: None,
            object_key: None,
            etag: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Create a session that is satisfied by an already stored object
    pub fn instant(params: UploadParams, existing: &StoredObject, ttl: Duration) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            file_name: params.file_name,
            file_size: params.file_size,
            file_type: params.file_type,
            chunk_size: params.chunk_size,
            total_chunks: 0,
            file_md5: params.file_md5,
            received_chunks: BTreeSet::new(),
            status: SessionStatus::Completed,
            file_url: Some(existing.file_url.clone()),
            object_key: Some(existing.object_key.clone()),
            etag: Some(existing.etag.clone()),
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// Chunk plan of this session
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan {
            file_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Check if session has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if all chunks have been received
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() == self.total_chunks
    }

    pub fn received_count(&self) -> usize {
        self.received_chunks.len()
    }

    /// Lowest `limit` indices of chunks that still need to be uploaded
    pub fn missing_chunks(&self, limit: usize) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|i| !self.received_chunks.contains(i))
            .take(limit)
            .collect()
    }

    /// Integer progress percentage
    pub fn progress(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (self.received_chunks.len() * 100 / self.total_chunks) as u8
    }

    /// Record a stored chunk and advance the state machine
    ///
    /// Returns `true` if the index was not received before.
    pub fn record_chunk(&mut self, index: usize, ttl: Duration) -> bool {
        let inserted = self.received_chunks.insert(index);
        self.status = self.status.on_chunk();
        self.touch(ttl);
        inserted
    }

    /// Mark the session failed after an integrity mismatch
    pub fn mark_failed(&mut self, ttl: Duration) {
        self.status = SessionStatus::Failed;
        self.touch(ttl);
    }

    /// Mark the session completed with its published object
    pub fn mark_completed(&mut self, object: &StoredObject, ttl: Duration) {
        self.status = SessionStatus::Completed;
        self.file_url = Some(object.file_url.clone());
        self.object_key = Some(object.object_key.clone());
        self.etag = Some(object.etag.clone());
        self.touch(ttl);
    }

    fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.updated_at = now;
        self.expires_at = now + ttl;
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for the first chunk
    Pending,
    /// Receiving chunks
    InProgress,
    /// File assembled and published
    Completed,
    /// Assembled file did not match the declared checksum
    Failed,
}

impl SessionStatus {
    /// Status after a chunk has been stored
    pub fn on_chunk(self) -> Self {
        match self {
            Self::Pending | Self::InProgress | Self::Failed => Self::InProgress,
            Self::Completed => Self::Completed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UploadError::StorageFailure(format!("unknown session status {:?}", other))),
        }
    }
}

// ============================================================================
// Stored Objects
// ============================================================================

/// A published file, as remembered by the checksum index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Hex MD5 of the file contents
    pub etag: String,
    pub object_key: String,
    pub file_url: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    /// Upload that first produced this object
    pub upload_id: Uuid,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error("Not all chunks uploaded: {received} of {total}")]
    IncompleteUpload { received: usize, total: usize },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::IncompleteUpload { .. } => StatusCode::CONFLICT,
            Self::IntegrityMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            Self::IntegrityMismatch { .. } => "INTEGRITY_MISMATCH",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
        }
    }

    /// Whether the same call may succeed later without client correction
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageFailure(_))
    }
}

impl From<crate::storage::StorageError> for UploadError {
    fn from(err: crate::storage::StorageError) -> Self {
        UploadError::StorageFailure(err.to_string())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Normalize a client-declared MD5; empty means "not declared"
pub fn normalize_md5(raw: Option<&str>) -> Result<Option<String>, UploadError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    if raw.len() != MD5_HEX_LEN || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UploadError::InvalidArgument(format!(
            "file_md5 must be {} hex characters",
            MD5_HEX_LEN
        )));
    }

    Ok(Some(raw.to_ascii_lowercase()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request(file_size: i64, chunk_size: i64) -> InitRequest {
        InitRequest {
            file_name: "testfile.txt".to_string(),
            file_size,
            file_type: "text/plain".to_string(),
            chunk_size,
            file_md5: None,
        }
    }

    #[test]
    fn test_chunk_plan_counts() {
        for (file_size, chunk_size) in [(1u64, 1u64), (10, 3), (10, 5), (7, 100), (2_500_000, 102_400)] {
            let plan = ChunkPlan::new(file_size, chunk_size).unwrap();
            let expected = file_size.div_ceil(chunk_size) as usize;
            assert_eq!(plan.total_chunks, expected);

            let last = plan.expected_len(plan.total_chunks - 1).unwrap();
            assert_eq!(last, file_size - chunk_size * (plan.total_chunks as u64 - 1));

            let total: u64 = (0..plan.total_chunks)
                .map(|i| plan.expected_len(i).unwrap())
                .sum();
            assert_eq!(total, file_size);
            assert!(plan.expected_len(plan.total_chunks).is_none());
        }
    }

    #[test]
    fn test_chunk_plan_scenario() {
        let plan = ChunkPlan::new(2_500_000, 102_400).unwrap();
        assert_eq!(plan.total_chunks, 25);
        assert_eq!(plan.expected_len(0), Some(102_400));
        assert_eq!(plan.expected_len(23), Some(102_400));
        assert_eq!(plan.expected_len(24), Some(4_600));
    }

    #[test]
    fn test_exact_multiple_has_full_last_chunk() {
        let plan = ChunkPlan::new(300, 100).unwrap();
        assert_eq!(plan.total_chunks, 3);
        assert_eq!(plan.expected_len(2), Some(100));
    }

    #[test]
    fn test_validate_rejects_non_positive_sizes() {
        let err = request(0, 10).validate(DEFAULT_MAX_FILE_SIZE).unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));

        let err = request(10, -1).validate(DEFAULT_MAX_FILE_SIZE).unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));

        let err = request(1000, 10).validate(999).unwrap_err();
        assert!(matches!(err, UploadError::InvalidArgument(_)));
    }

    #[test]
    fn test_md5_normalization() {
        assert_eq!(normalize_md5(None).unwrap(), None);
        assert_eq!(normalize_md5(Some("  ")).unwrap(), None);
        assert_eq!(
            normalize_md5(Some("D41D8CD98F00B204E9800998ECF8427E")).unwrap(),
            Some("d41d8cd98f00b204e9800998ecf8427e".to_string())
        );
        assert!(normalize_md5(Some("abc")).is_err());
        assert!(normalize_md5(Some("z41d8cd98f00b204e9800998ecf8427e")).is_err());
    }

    #[test]
    fn test_state_machine() {
        let params = request(20, 10).validate(DEFAULT_MAX_FILE_SIZE).unwrap();
        let plan = ChunkPlan::new(params.file_size, params.chunk_size).unwrap();
        let ttl = Duration::seconds(60);
        let mut session = UploadSession::new(params, plan, ttl);

        assert_eq!(session.status, SessionStatus::Pending);
        assert!(session.record_chunk(1, ttl));
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(!session.record_chunk(1, ttl));
        assert_eq!(session.received_count(), 1);
        assert_eq!(session.missing_chunks(10), vec![0]);
        assert!(session.missing_chunks(0).is_empty());
        assert_eq!(session.progress(), 50);

        session.mark_failed(ttl);
        assert_eq!(session.status, SessionStatus::Failed);
        session.record_chunk(0, ttl);
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.is_complete());
        assert!(session.file_url.is_none());
    }

    #[test]
    fn test_status_response_caps_missing_list() {
        let params = request(5_000, 1).validate(DEFAULT_MAX_FILE_SIZE).unwrap();
        let plan = ChunkPlan::new(params.file_size, params.chunk_size).unwrap();
        let mut session = UploadSession::new(params, plan, Duration::seconds(60));
        session.record_chunk(0, Duration::seconds(60));

        let status = StatusResponse::from(&session);
        assert_eq!(status.missing_count, 4_999);
        assert_eq!(status.missing_chunks.len(), MISSING_CHUNKS_LIMIT);
        assert_eq!(status.missing_chunks[0], 1);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("done".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_error_codes() {
        let err = UploadError::IncompleteUpload { received: 1, total: 2 };
        assert_eq!(err.code(), "INCOMPLETE_UPLOAD");
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
        assert!(!err.is_retryable());
        assert!(UploadError::StorageFailure("disk".into()).is_retryable());
    }
}
