//! Chunked upload sessions: registration, ingestion, reassembly, and sweep.

mod manager;
mod types;

pub use manager::SessionManager;
pub use types::{
    ChunkReceipt, ChunkRecord, SessionStatus, UploadError, UploadLimits, UploadSession,
};
