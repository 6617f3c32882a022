//! Session records and error definitions for chunked uploads.

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting chunks.
    Uploading,
    /// All chunks received and reassembled into an artifact.
    Completed,
    /// Reassembly failed; the session accepts no further chunks.
    Failed,
}

/// Bookkeeping for one received chunk.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Temporary file holding the chunk bytes.
    pub path: PathBuf,
    /// Chunk length in bytes.
    pub size: u64,
    /// Receipt timestamp.
    pub received_at: OffsetDateTime,
}

/// Bookkeeping record for one client's chunked upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Server-generated session identifier.
    pub id: Uuid,
    /// Client-declared file name, used to derive the artifact extension.
    pub filename: String,
    /// Declared total size in bytes.
    pub declared_size: u64,
    /// Negotiated chunk size in bytes.
    pub chunk_size: u64,
    /// `ceil(declared_size / chunk_size)`.
    pub expected_chunks: u32,
    /// Received chunks keyed by index; indices need not arrive in order.
    pub received: HashMap<u32, ChunkRecord>,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Reassembled artifact, set only once the session completes.
    pub artifact_path: Option<PathBuf>,
    /// Creation timestamp, used by the expiry sweep.
    pub created_at: OffsetDateTime,
}

/// Configured bounds on upload sizes.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    /// Maximum declared file size in bytes.
    pub max_file_size: u64,
    /// Smallest accepted chunk size in bytes.
    pub min_chunk_size: u64,
    /// Largest accepted chunk size in bytes.
    pub max_chunk_size: u64,
    /// Chunk size applied when the client does not request one.
    pub default_chunk_size: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_file_size: 20 * 1024 * 1024,
            min_chunk_size: 1024,
            max_chunk_size: 5 * 1024 * 1024,
            default_chunk_size: 512 * 1024,
        }
    }
}

/// Outcome of one chunk ingestion.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChunkReceipt {
    /// Distinct chunk indices received so far.
    pub received: u32,
    /// Total chunks the session expects.
    pub expected: u32,
    /// Whether the session reassembled on this call.
    pub complete: bool,
}

/// Errors produced by the upload session manager.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Request parameters fall outside the configured bounds.
    #[error("invalid upload parameters: {0}")]
    InvalidInput(String),
    /// No session exists for the given identifier.
    #[error("unknown upload session {0}")]
    SessionNotFound(Uuid),
    /// The session is not accepting chunks in its current state.
    #[error("session {id} is {status:?}, not accepting chunks")]
    InvalidState {
        /// Session identifier.
        id: Uuid,
        /// State the session was found in.
        status: SessionStatus,
    },
    /// Chunk index is outside `[0, total_chunks)`.
    #[error("chunk index {index} out of range for {total} chunks")]
    ChunkOutOfRange {
        /// Offending index.
        index: u32,
        /// Declared total chunk count.
        total: u32,
    },
    /// Reassembly was attempted with a chunk count mismatch.
    #[error("incomplete upload: received {received} of {expected} chunks")]
    IncompleteUpload {
        /// Distinct chunk indices on disk.
        received: u32,
        /// Expected chunk count.
        expected: u32,
    },
    /// Chunk or artifact I/O failed.
    #[error("upload storage failed: {0}")]
    Io(#[from] std::io::Error),
}
