use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing upload and pipeline activity.
#[derive(Default)]
pub struct ServiceMetrics {
    sessions_created: AtomicU64,
    chunks_received: AtomicU64,
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
}

impl ServiceMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly registered upload session.
    pub fn record_session(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one ingested chunk.
    pub fn record_chunk(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job accepted for processing.
    pub fn record_submission(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching a successful terminal state.
    pub fn record_completion(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a job reaching a failed terminal state.
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a client-initiated cancellation.
    pub fn record_cancellation(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of activity counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Upload sessions registered since startup.
    pub sessions_created: u64,
    /// Chunks ingested across all sessions.
    pub chunks_received: u64,
    /// Jobs accepted by the pipeline engine.
    pub jobs_submitted: u64,
    /// Jobs that finished successfully.
    pub jobs_completed: u64,
    /// Jobs that ended in failure.
    pub jobs_failed: u64,
    /// Jobs cancelled before completion.
    pub jobs_cancelled: u64,
}
