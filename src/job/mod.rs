//! Asynchronous scan jobs: submission, the stage pipeline, status polling,
//! and cooperative cancellation.

mod engine;
mod types;

pub use engine::JobEngine;
pub use types::{Job, JobError, JobErrorKind, JobFailure, JobStage, JobStatus, ScanResult};
