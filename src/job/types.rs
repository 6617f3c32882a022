//! Job records, stages, and error definitions for the scan pipeline.

use crate::recognize::Classification;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Lifecycle state of one scan job.
///
/// `Pending` and `Active` are non-terminal; the other three states are
/// terminal and immutable once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting for the pipeline driver.
    Pending,
    /// Pipeline driver is running stages.
    Active,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the client before completion.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Pipeline stage the driver last entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    /// Not yet picked up.
    Queued,
    /// Normalizing the source image.
    Optimizing,
    /// Running text recognition.
    Extracting,
    /// Deriving structured fields.
    Classifying,
    /// Assembling the result and cleaning up.
    Finalizing,
}

/// Terminal result of a successful scan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// Text extracted by the recognition engine.
    pub extracted_text: String,
    /// Structured fields, possibly a degraded fallback.
    pub classification: Classification,
    /// Overall confidence in `[0, 1]`.
    pub confidence: f32,
    /// When the pipeline finished.
    #[serde(with = "time::serde::rfc3339")]
    pub processed_at: OffsetDateTime,
}

/// Machine-readable failure kinds reported to polling clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Recognition produced empty text or the engine failed.
    ExtractionFailed,
    /// The client cancelled the job.
    Cancelled,
    /// Unexpected pipeline failure; details are logged server-side.
    Internal,
}

/// Terminal failure attached to a failed or cancelled job.
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    /// Failure category.
    pub kind: JobErrorKind,
    /// Human-readable message.
    pub message: String,
}

/// Bookkeeping record for one asynchronous processing run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Job identifier, independent of the session id.
    pub id: Uuid,
    /// Upload session that produced the input artifact.
    pub source_session_id: Uuid,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Last pipeline stage entered.
    pub stage: JobStage,
    /// Fractional progress, monotonically non-decreasing while active.
    pub progress: f32,
    /// Present only in terminal success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResult>,
    /// Present only in terminal failure or cancellation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    /// Creation timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Set when the driver picks the job up.
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    /// Set when a terminal state is entered.
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

/// Errors surfaced by job engine operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// No job exists for the given identifier.
    #[error("unknown job {0}")]
    NotFound(Uuid),
    /// No upload session exists for the given identifier.
    #[error("unknown upload session {0}")]
    SessionNotFound(Uuid),
    /// The referenced session has not completed its upload.
    #[error("upload session {0} has no completed artifact")]
    SessionNotReady(Uuid),
    /// The operation is not valid for the job's current state.
    #[error("job {id} is already {status:?}")]
    InvalidState {
        /// Job identifier.
        id: Uuid,
        /// Terminal state the job was found in.
        status: JobStatus,
    },
}
