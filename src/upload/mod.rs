//! Chunked Upload Module
//!
//! Implements resumable large file uploads with:
//! - Fixed-size chunks accepted in any order, resubmission allowed
//! - Whole-file MD5 verification before publishing
//! - Instant upload when the server already holds identical content
//! - Sessions journaled to SQLite so uploads resume after a restart
//!
//! Protocol Flow:
//! 1. Client sends init with file size, chunk size and optional MD5
//! 2. Server answers with an upload ID and chunk count (0 if deduplicated)
//! 3. Client uploads each chunk by index
//! 4. Client asks the server to complete; the file is merged and published

pub mod checksum_index;
pub mod chunk_store;
pub mod coordinator;
pub mod journal;
pub mod merge;
pub mod session;
pub mod types;

pub use checksum_index::{ChecksumIndex, MemoryChecksumIndex, SqliteChecksumIndex};
pub use chunk_store::{ChunkStorage, ChunkStore};
pub use coordinator::{UploadCoordinator, UploadSettings};
pub use journal::{SessionJournal, SqliteSessionJournal};
pub use merge::MergeEngine;
pub use session::SessionRepository;
pub use types::*;
