//! Pipeline driver and job store.

use crate::job::types::{
    Job, JobError, JobErrorKind, JobFailure, JobStage, JobStatus, ScanResult,
};
use crate::metrics::ServiceMetrics;
use crate::recognize::{Classification, FieldClassifier, TextRecognizer};
use crate::upload::{SessionManager, SessionStatus};
use anyhow::Context as _;
use image::imageops::FilterType;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Longest edge of the optimized image handed to the recognition engine.
/// Caps recognition cost without hurting accuracy on typical document scans.
const MAX_OPTIMIZED_DIMENSION: u32 = 2000;

/// Runs the four-stage scan pipeline over reassembled artifacts.
///
/// The engine owns the job map and long-lived collaborator handles. Each
/// submitted job gets its own spawned driver task; the job record behind a
/// per-job lock is the only state shared between the submitting request and
/// the driver. Jobs are retained after completion for polling; eviction is a
/// deployment concern.
pub struct JobEngine {
    jobs: RwLock<HashMap<Uuid, Arc<RwLock<Job>>>>,
    recognizer: Arc<dyn TextRecognizer>,
    classifier: Arc<dyn FieldClassifier>,
    metrics: Arc<ServiceMetrics>,
}

impl JobEngine {
    /// Build an engine around the given collaborators.
    pub fn new(
        recognizer: Arc<dyn TextRecognizer>,
        classifier: Arc<dyn FieldClassifier>,
        metrics: Arc<ServiceMetrics>,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            recognizer,
            classifier,
            metrics,
        }
    }

    /// Create a job for a completed upload session and schedule its pipeline.
    ///
    /// Returns as soon as the job record exists; the pipeline runs on its own
    /// task. Fails with [`JobError::SessionNotFound`] or
    /// [`JobError::SessionNotReady`] when the session is unknown or has not
    /// finished uploading.
    pub async fn submit(
        self: &Arc<Self>,
        sessions: &SessionManager,
        session_id: Uuid,
    ) -> Result<Uuid, JobError> {
        let session = sessions
            .get_session(session_id)
            .await
            .ok_or(JobError::SessionNotFound(session_id))?;
        if session.status != SessionStatus::Completed {
            return Err(JobError::SessionNotReady(session_id));
        }
        let artifact = session
            .artifact_path
            .ok_or(JobError::SessionNotReady(session_id))?;

        let id = Uuid::new_v4();
        let job = Job {
            id,
            source_session_id: session_id,
            status: JobStatus::Pending,
            stage: JobStage::Queued,
            progress: 0.0,
            result: None,
            error: None,
            created_at: OffsetDateTime::now_utc(),
            started_at: None,
            completed_at: None,
        };
        self.jobs
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(job)));
        self.metrics.record_submission();
        tracing::info!(job = %id, session = %session_id, "Job submitted");

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_pipeline(id, artifact).await;
        });
        Ok(id)
    }

    /// Return a consistent snapshot of a job, safe to call while the pipeline
    /// is mid-flight.
    pub async fn get_status(&self, id: Uuid) -> Result<Job, JobError> {
        let handle = self.job_handle(id).await.ok_or(JobError::NotFound(id))?;
        let job = handle.read().await;
        Ok(job.clone())
    }

    /// Cooperatively cancel a pending or active job.
    ///
    /// The status flips to `Cancelled` immediately; in-flight collaborator
    /// work is not interrupted and its late output is discarded. Fails with
    /// [`JobError::InvalidState`] once the job is terminal.
    pub async fn cancel(&self, id: Uuid) -> Result<(), JobError> {
        let handle = self.job_handle(id).await.ok_or(JobError::NotFound(id))?;
        let mut job = handle.write().await;
        if job.status.is_terminal() {
            return Err(JobError::InvalidState {
                id,
                status: job.status,
            });
        }
        job.status = JobStatus::Cancelled;
        job.error = Some(JobFailure {
            kind: JobErrorKind::Cancelled,
            message: "cancelled by client".to_string(),
        });
        job.completed_at = Some(OffsetDateTime::now_utc());
        self.metrics.record_cancellation();
        tracing::info!(job = %id, "Job cancelled");
        Ok(())
    }

    async fn job_handle(&self, id: Uuid) -> Option<Arc<RwLock<Job>>> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// Drive one job through optimize → extract → classify → finalize.
    ///
    /// Every status write goes through a compare-and-set that refuses to
    /// touch a terminal record, so a concurrent cancellation wins and the
    /// driver's remaining work is discarded. Intermediate artifacts are
    /// deleted on every exit path.
    async fn run_pipeline(self: Arc<Self>, id: Uuid, artifact: PathBuf) {
        let Some(handle) = self.job_handle(id).await else {
            tracing::error!(job = %id, "Job record vanished before pipeline start");
            return;
        };

        if !begin(&handle).await {
            discard_artifacts(&artifact, None).await;
            return;
        }

        let optimized = match optimize_image(&artifact).await {
            Ok(path) => path,
            Err(err) => {
                tracing::error!(job = %id, error = ?err, "Image optimization failed");
                self.fail(&handle, JobErrorKind::Internal, "image optimization failed")
                    .await;
                discard_artifacts(&artifact, None).await;
                return;
            }
        };

        if !advance(&handle, JobStage::Extracting, 0.2).await {
            discard_artifacts(&artifact, Some(&optimized)).await;
            return;
        }

        let (progress_tx, mut progress_rx) = mpsc::channel::<f32>(16);
        let progress_handle = Arc::clone(&handle);
        let forwarder = tokio::spawn(async move {
            // Recognition progress maps linearly into the 0.3–0.7 band.
            while let Some(value) = progress_rx.recv().await {
                set_progress(&progress_handle, 0.3 + 0.4 * value.clamp(0.0, 1.0)).await;
            }
        });
        let extracted = self.recognizer.extract_text(&optimized, progress_tx).await;
        let _ = forwarder.await;

        let text = match extracted {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                // Empty output is always a failure, never a valid empty result.
                self.fail(
                    &handle,
                    JobErrorKind::ExtractionFailed,
                    "recognition produced no text",
                )
                .await;
                discard_artifacts(&artifact, Some(&optimized)).await;
                return;
            }
            Err(err) => {
                tracing::error!(job = %id, error = %err, "Recognition failed");
                self.fail(&handle, JobErrorKind::ExtractionFailed, &err.to_string())
                    .await;
                discard_artifacts(&artifact, Some(&optimized)).await;
                return;
            }
        };

        if !advance(&handle, JobStage::Classifying, 0.7).await {
            discard_artifacts(&artifact, Some(&optimized)).await;
            return;
        }

        let classification = match self.classifier.classify(&text).await {
            Ok(classification) => classification,
            Err(err) => {
                // Partial results are still useful: degrade instead of failing.
                tracing::warn!(job = %id, error = %err, "Classification failed, using fallback");
                Classification::fallback()
            }
        };

        if !advance(&handle, JobStage::Finalizing, 0.9).await {
            discard_artifacts(&artifact, Some(&optimized)).await;
            return;
        }

        discard_artifacts(&artifact, Some(&optimized)).await;
        let confidence = classification.confidence;
        self.complete(
            &handle,
            ScanResult {
                extracted_text: text,
                classification,
                confidence,
                processed_at: OffsetDateTime::now_utc(),
            },
        )
        .await;
    }

    async fn fail(&self, handle: &Arc<RwLock<Job>>, kind: JobErrorKind, message: &str) {
        let mut job = handle.write().await;
        if job.status.is_terminal() {
            tracing::debug!(job = %job.id, "Discarding failure for terminal job");
            return;
        }
        job.status = JobStatus::Failed;
        job.error = Some(JobFailure {
            kind,
            message: message.to_string(),
        });
        job.completed_at = Some(OffsetDateTime::now_utc());
        self.metrics.record_failure();
        tracing::warn!(job = %job.id, ?kind, message, "Job failed");
    }

    async fn complete(&self, handle: &Arc<RwLock<Job>>, result: ScanResult) {
        let mut job = handle.write().await;
        if job.status.is_terminal() {
            // Cancelled mid-stage; the late result is simply dropped.
            tracing::debug!(job = %job.id, "Discarding result for terminal job");
            return;
        }
        job.status = JobStatus::Completed;
        job.progress = 1.0;
        job.result = Some(result);
        job.completed_at = Some(OffsetDateTime::now_utc());
        self.metrics.record_completion();
        tracing::info!(job = %job.id, "Job completed");
    }
}

/// Transition `pending → active` and enter the optimizing stage.
/// Returns false when the job was cancelled before pickup.
async fn begin(handle: &Arc<RwLock<Job>>) -> bool {
    let mut job = handle.write().await;
    if job.status != JobStatus::Pending {
        return false;
    }
    job.status = JobStatus::Active;
    job.started_at = Some(OffsetDateTime::now_utc());
    job.stage = JobStage::Optimizing;
    job.progress = job.progress.max(0.1);
    true
}

/// Enter the next stage with its milestone progress.
/// Returns false when the job has reached a terminal state.
async fn advance(handle: &Arc<RwLock<Job>>, stage: JobStage, progress: f32) -> bool {
    let mut job = handle.write().await;
    if job.status.is_terminal() {
        return false;
    }
    job.stage = stage;
    job.progress = job.progress.max(progress);
    true
}

/// Raise progress, never lowering it.
async fn set_progress(handle: &Arc<RwLock<Job>>, progress: f32) {
    let mut job = handle.write().await;
    if job.status.is_terminal() {
        return;
    }
    job.progress = job.progress.max(progress.clamp(0.0, 1.0));
}

/// Normalize the source image for recognition: bounded downscale, grayscale,
/// contrast stretch, and a mild sharpen. Produces `optimized.png` beside the
/// original, which is retained until final cleanup.
async fn optimize_image(artifact: &Path) -> anyhow::Result<PathBuf> {
    let source = artifact.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let img = image::open(&source)
            .with_context(|| format!("failed to decode {}", source.display()))?;
        let img = if img.width().max(img.height()) > MAX_OPTIMIZED_DIMENSION {
            img.resize(
                MAX_OPTIMIZED_DIMENSION,
                MAX_OPTIMIZED_DIMENSION,
                FilterType::Lanczos3,
            )
        } else {
            img
        };
        let img = img.grayscale().adjust_contrast(12.0).unsharpen(1.5, 4);
        let output = source.with_file_name("optimized.png");
        img.save(&output)
            .with_context(|| format!("failed to write {}", output.display()))?;
        Ok(output)
    })
    .await
    .context("optimization task panicked")?
}

/// Delete intermediate artifacts, tolerating files that are already gone.
async fn discard_artifacts(original: &Path, optimized: Option<&Path>) {
    for path in std::iter::once(original).chain(optimized) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(artifact = %path.display(), error = %err, "Failed to delete artifact");
            }
        }
    }
}
