//! Session store and chunk reassembly.

use crate::upload::types::{
    ChunkReceipt, ChunkRecord, SessionStatus, UploadError, UploadLimits, UploadSession,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Bytes of slack tolerated between the artifact length and the sum of chunk
/// sizes before a warning is logged. Small discrepancies from intermediate
/// buffering are harmless.
const REASSEMBLY_SIZE_TOLERANCE: u64 = 1024;

/// Owns the lifecycle of client-driven chunked uploads.
///
/// Each session's mutable state sits behind its own mutex so ingestion of
/// distinct indices for one session serializes without blocking unrelated
/// sessions. Chunk files live under `<root>/<session-id>/chunk_<index>.part`
/// and the reassembled artifact beside them.
pub struct SessionManager {
    root: PathBuf,
    limits: UploadLimits,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<UploadSession>>>>,
}

impl SessionManager {
    /// Build a manager storing chunk files under `root`.
    pub fn new(root: impl Into<PathBuf>, limits: UploadLimits) -> Self {
        Self {
            root: root.into(),
            limits,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Configured upload bounds.
    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Register a new upload session and create its chunk directory.
    ///
    /// `chunk_size` defaults to the configured value when absent. Fails with
    /// [`UploadError::InvalidInput`] when the declared size or chunk size
    /// falls outside the configured bounds.
    pub async fn create_session(
        &self,
        filename: &str,
        declared_size: u64,
        chunk_size: Option<u64>,
    ) -> Result<UploadSession, UploadError> {
        if filename.trim().is_empty() {
            return Err(UploadError::InvalidInput("filename must not be empty".into()));
        }
        if declared_size == 0 {
            return Err(UploadError::InvalidInput(
                "declared size must be greater than zero".into(),
            ));
        }
        if declared_size > self.limits.max_file_size {
            return Err(UploadError::InvalidInput(format!(
                "declared size {declared_size} exceeds maximum {}",
                self.limits.max_file_size
            )));
        }
        let chunk_size = chunk_size.unwrap_or(self.limits.default_chunk_size);
        if chunk_size < self.limits.min_chunk_size || chunk_size > self.limits.max_chunk_size {
            return Err(UploadError::InvalidInput(format!(
                "chunk size {chunk_size} outside [{}, {}]",
                self.limits.min_chunk_size, self.limits.max_chunk_size
            )));
        }

        let expected_chunks =
            u32::try_from(declared_size.div_ceil(chunk_size)).map_err(|_| {
                UploadError::InvalidInput(format!(
                    "upload would require more than {} chunks",
                    u32::MAX
                ))
            })?;

        let id = Uuid::new_v4();
        let session = UploadSession {
            id,
            filename: filename.to_string(),
            declared_size,
            chunk_size,
            expected_chunks,
            received: HashMap::new(),
            status: SessionStatus::Uploading,
            artifact_path: None,
            created_at: OffsetDateTime::now_utc(),
        };
        tokio::fs::create_dir_all(self.session_dir(id)).await?;

        let snapshot = session.clone();
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::info!(
            session = %id,
            filename,
            declared_size,
            chunk_size,
            expected_chunks = snapshot.expected_chunks,
            "Upload session created"
        );
        Ok(snapshot)
    }

    /// Return a point-in-time snapshot of a session, if it exists.
    pub async fn get_session(&self, id: Uuid) -> Option<UploadSession> {
        let handle = self.sessions.read().await.get(&id).cloned()?;
        let session = handle.lock().await;
        Some(session.clone())
    }

    /// Store one chunk and reassemble the artifact once all chunks are in.
    ///
    /// Re-ingesting an index overwrites the prior chunk (last write wins), so
    /// client retries never inflate the received count. When the count reaches
    /// the expected total, reassembly runs synchronously before returning.
    pub async fn ingest_chunk(
        &self,
        id: Uuid,
        index: u32,
        total_chunks: u32,
        bytes: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        let handle = self
            .sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(UploadError::SessionNotFound(id))?;
        let mut session = handle.lock().await;

        if session.status != SessionStatus::Uploading {
            return Err(UploadError::InvalidState {
                id,
                status: session.status,
            });
        }
        if total_chunks != session.expected_chunks {
            return Err(UploadError::InvalidInput(format!(
                "declared total {total_chunks} disagrees with session total {}",
                session.expected_chunks
            )));
        }
        if index >= total_chunks {
            return Err(UploadError::ChunkOutOfRange {
                index,
                total: total_chunks,
            });
        }
        // The size bounds negotiated at creation cap resource usage; a
        // payload above the chunk size would let a client blow past them.
        // The final chunk may be shorter.
        if bytes.len() as u64 > session.chunk_size {
            return Err(UploadError::InvalidInput(format!(
                "chunk of {} bytes exceeds negotiated chunk size {}",
                bytes.len(),
                session.chunk_size
            )));
        }

        let path = self.session_dir(id).join(format!("chunk_{index}.part"));
        tokio::fs::write(&path, bytes).await?;
        session.received.insert(
            index,
            ChunkRecord {
                path,
                size: bytes.len() as u64,
                received_at: OffsetDateTime::now_utc(),
            },
        );

        let received = session.received.len() as u32;
        let expected = session.expected_chunks;
        tracing::debug!(session = %id, index, received, expected, "Chunk stored");

        let complete = received == expected;
        if complete {
            if let Err(err) = reassemble(&mut session).await {
                session.status = SessionStatus::Failed;
                tracing::error!(session = %id, error = %err, "Reassembly failed");
                return Err(err);
            }
        }

        Ok(ChunkReceipt {
            received,
            expected,
            complete,
        })
    }

    /// Remove a session's chunk files, artifact, and in-memory record.
    ///
    /// Safe to call repeatedly; deletion failures are logged, never
    /// propagated to the caller.
    pub async fn cleanup(&self, id: Uuid) {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_none() {
            tracing::debug!(session = %id, "Cleanup for unknown session ignored");
            return;
        }
        if let Err(err) = tokio::fs::remove_dir_all(self.session_dir(id)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(session = %id, error = %err, "Failed to delete session files");
            }
        }
        tracing::info!(session = %id, "Upload session cleaned up");
    }

    /// Clean up sessions created more than `max_age` ago, returning how many
    /// were removed. Intended to run periodically from a background task.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let mut expired = Vec::new();
        {
            let sessions = self.sessions.read().await;
            for (id, handle) in sessions.iter() {
                let session = handle.lock().await;
                if session.created_at < cutoff {
                    expired.push(*id);
                }
            }
        }
        for id in &expired {
            self.cleanup(*id).await;
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Swept expired upload sessions");
        }
        expired.len()
    }

    fn session_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }
}

/// Concatenate received chunks strictly in index order into one artifact.
///
/// Chunk files are deleted as they are consumed, and best-effort deleted on
/// every failure path. The artifact length is compared against the sum of
/// recorded chunk sizes; a discrepancy beyond the tolerance is logged as a
/// warning but is not fatal. `Completed` and `artifact_path` are set only
/// after concatenation succeeds.
async fn reassemble(session: &mut UploadSession) -> Result<(), UploadError> {
    let received = session.received.len() as u32;
    if received != session.expected_chunks {
        return Err(UploadError::IncompleteUpload {
            received,
            expected: session.expected_chunks,
        });
    }

    let mut indices: Vec<u32> = session.received.keys().copied().collect();
    indices.sort_unstable();

    let dir = session
        .received
        .values()
        .next()
        .and_then(|record| record.path.parent())
        .map(Path::to_path_buf)
        .ok_or_else(|| UploadError::IncompleteUpload {
            received: 0,
            expected: session.expected_chunks,
        })?;
    let artifact_path = dir.join(format!("artifact.{}", artifact_extension(&session.filename)));

    let mut artifact = tokio::fs::File::create(&artifact_path).await?;
    let mut written: u64 = 0;
    let mut declared: u64 = 0;

    for (position, index) in indices.iter().enumerate() {
        let record = &session.received[index];
        declared += record.size;
        let outcome = append_chunk(&mut artifact, &record.path).await;
        remove_chunk_file(&record.path).await;
        match outcome {
            Ok(bytes) => written += bytes,
            Err(err) => {
                // Consume failed mid-stream: release the rest of the chunk
                // files before surfacing the error.
                for index in &indices[position + 1..] {
                    remove_chunk_file(&session.received[index].path).await;
                }
                return Err(err.into());
            }
        }
    }
    artifact.flush().await?;

    if written.abs_diff(declared) > REASSEMBLY_SIZE_TOLERANCE {
        tracing::warn!(
            session = %session.id,
            written,
            declared,
            "Artifact length deviates from recorded chunk sizes"
        );
    }

    session.status = SessionStatus::Completed;
    session.artifact_path = Some(artifact_path.clone());
    tracing::info!(
        session = %session.id,
        artifact = %artifact_path.display(),
        bytes = written,
        "Upload reassembled"
    );
    Ok(())
}

async fn append_chunk(
    artifact: &mut tokio::fs::File,
    chunk: &Path,
) -> Result<u64, std::io::Error> {
    let bytes = tokio::fs::read(chunk).await?;
    artifact.write_all(&bytes).await?;
    Ok(bytes.len() as u64)
}

async fn remove_chunk_file(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(chunk = %path.display(), error = %err, "Failed to delete chunk file");
        }
    }
}

fn artifact_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_lowercase)
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path) -> SessionManager {
        SessionManager::new(
            root,
            UploadLimits {
                max_file_size: 1024 * 1024,
                min_chunk_size: 4,
                max_chunk_size: 4096,
                default_chunk_size: 16,
            },
        )
    }

    #[tokio::test]
    async fn rejects_out_of_bounds_parameters() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());

        let oversized = manager
            .create_session("big.jpg", 2 * 1024 * 1024, Some(16))
            .await;
        assert!(matches!(oversized, Err(UploadError::InvalidInput(_))));

        let tiny_chunks = manager.create_session("r.jpg", 100, Some(2)).await;
        assert!(matches!(tiny_chunks, Err(UploadError::InvalidInput(_))));

        let empty = manager.create_session("r.jpg", 0, Some(16)).await;
        assert!(matches!(empty, Err(UploadError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn expected_count_is_ceiling_division() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 3000, Some(1000))
            .await
            .expect("session");
        assert_eq!(session.expected_chunks, 3);

        let uneven = manager
            .create_session("r.jpg", 3001, Some(1000))
            .await
            .expect("session");
        assert_eq!(uneven.expected_chunks, 4);
    }

    #[tokio::test]
    async fn arrival_order_does_not_affect_output() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let chunks: [&[u8]; 3] = [b"alpha---", b"beta----", b"gamma---"];

        let ordered = manager
            .create_session("a.jpg", 24, Some(8))
            .await
            .expect("session");
        for index in [0u32, 1, 2] {
            manager
                .ingest_chunk(ordered.id, index, 3, chunks[index as usize])
                .await
                .expect("ingest");
        }

        let shuffled = manager
            .create_session("b.jpg", 24, Some(8))
            .await
            .expect("session");
        for index in [2u32, 0, 1] {
            manager
                .ingest_chunk(shuffled.id, index, 3, chunks[index as usize])
                .await
                .expect("ingest");
        }

        let first = manager.get_session(ordered.id).await.expect("snapshot");
        let second = manager.get_session(shuffled.id).await.expect("snapshot");
        assert_eq!(first.status, SessionStatus::Completed);
        assert_eq!(second.status, SessionStatus::Completed);

        let first_bytes = std::fs::read(first.artifact_path.expect("artifact")).expect("read");
        let second_bytes = std::fs::read(second.artifact_path.expect("artifact")).expect("read");
        assert_eq!(first_bytes, second_bytes);
        assert_eq!(first_bytes, b"alpha---beta----gamma---");
    }

    #[tokio::test]
    async fn duplicate_index_replaces_instead_of_duplicating() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 16, Some(8))
            .await
            .expect("session");

        let first = manager
            .ingest_chunk(session.id, 0, 2, b"old-data")
            .await
            .expect("ingest");
        assert_eq!(first.received, 1);

        let retry = manager
            .ingest_chunk(session.id, 0, 2, b"new-data")
            .await
            .expect("ingest");
        assert_eq!(retry.received, 1);
        assert!(!retry.complete);

        let last = manager
            .ingest_chunk(session.id, 1, 2, b"tail-end")
            .await
            .expect("ingest");
        assert!(last.complete);

        let snapshot = manager.get_session(session.id).await.expect("snapshot");
        let bytes = std::fs::read(snapshot.artifact_path.expect("artifact")).expect("read");
        assert_eq!(bytes, b"new-datatail-end");
    }

    #[tokio::test]
    async fn chunk_files_are_deleted_after_reassembly() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 16, Some(8))
            .await
            .expect("session");
        manager
            .ingest_chunk(session.id, 0, 2, b"01234567")
            .await
            .expect("ingest");
        manager
            .ingest_chunk(session.id, 1, 2, b"89abcdef")
            .await
            .expect("ingest");

        let session_dir = dir.path().join(session.id.to_string());
        let leftovers: Vec<_> = std::fs::read_dir(&session_dir)
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["artifact.jpg".to_string()]);
    }

    #[tokio::test]
    async fn rejects_bad_indices_and_unknown_sessions() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 16, Some(8))
            .await
            .expect("session");

        let out_of_range = manager.ingest_chunk(session.id, 2, 2, b"x").await;
        assert!(matches!(
            out_of_range,
            Err(UploadError::ChunkOutOfRange { index: 2, total: 2 })
        ));

        let total_mismatch = manager.ingest_chunk(session.id, 0, 5, b"x").await;
        assert!(matches!(total_mismatch, Err(UploadError::InvalidInput(_))));

        let unknown = manager.ingest_chunk(Uuid::new_v4(), 0, 2, b"x").await;
        assert!(matches!(unknown, Err(UploadError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn rejects_chunks_larger_than_the_negotiated_size() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 16, Some(8))
            .await
            .expect("session");

        let oversized = manager
            .ingest_chunk(session.id, 0, 2, &[0u8; 1024])
            .await;
        assert!(matches!(oversized, Err(UploadError::InvalidInput(_))));

        // The rejected payload must not count toward completion.
        let snapshot = manager.get_session(session.id).await.expect("snapshot");
        assert_eq!(snapshot.received.len(), 0);
        assert_eq!(snapshot.status, SessionStatus::Uploading);

        // Full-size chunks and a shorter final chunk are still accepted.
        manager
            .ingest_chunk(session.id, 0, 2, b"01234567")
            .await
            .expect("ingest");
        let receipt = manager
            .ingest_chunk(session.id, 1, 2, b"89ab")
            .await
            .expect("ingest");
        assert!(receipt.complete);
    }

    #[tokio::test]
    async fn rejects_chunk_counts_beyond_u32() {
        let dir = tempdir().expect("tempdir");
        let manager = SessionManager::new(
            dir.path(),
            UploadLimits {
                max_file_size: u64::MAX,
                min_chunk_size: 4,
                max_chunk_size: 4096,
                default_chunk_size: 16,
            },
        );

        let absurd = manager.create_session("x.bin", u64::MAX, Some(4)).await;
        assert!(matches!(absurd, Err(UploadError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn completed_session_rejects_further_chunks() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 8, Some(8))
            .await
            .expect("session");
        let receipt = manager
            .ingest_chunk(session.id, 0, 1, b"payload!")
            .await
            .expect("ingest");
        assert!(receipt.complete);

        let rejected = manager.ingest_chunk(session.id, 0, 1, b"payload!").await;
        assert!(matches!(
            rejected,
            Err(UploadError::InvalidState {
                status: SessionStatus::Completed,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn reassembly_guards_against_count_mismatch() {
        let dir = tempdir().expect("tempdir");
        let chunk = dir.path().join("chunk_0.part");
        std::fs::write(&chunk, b"data").expect("write");

        let mut session = UploadSession {
            id: Uuid::new_v4(),
            filename: "r.jpg".into(),
            declared_size: 8,
            chunk_size: 4,
            expected_chunks: 2,
            received: HashMap::from([(
                0,
                ChunkRecord {
                    path: chunk,
                    size: 4,
                    received_at: OffsetDateTime::now_utc(),
                },
            )]),
            status: SessionStatus::Uploading,
            artifact_path: None,
            created_at: OffsetDateTime::now_utc(),
        };

        let err = reassemble(&mut session).await.expect_err("must not complete");
        assert!(matches!(
            err,
            UploadError::IncompleteUpload {
                received: 1,
                expected: 2
            }
        ));
        assert_eq!(session.status, SessionStatus::Uploading);
        assert!(session.artifact_path.is_none());
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_and_removes_files() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let session = manager
            .create_session("r.jpg", 8, Some(8))
            .await
            .expect("session");
        manager
            .ingest_chunk(session.id, 0, 1, b"payload!")
            .await
            .expect("ingest");

        manager.cleanup(session.id).await;
        assert!(manager.get_session(session.id).await.is_none());
        assert!(!dir.path().join(session.id.to_string()).exists());

        // Second call must be a no-op.
        manager.cleanup(session.id).await;
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let dir = tempdir().expect("tempdir");
        let manager = manager(dir.path());
        let stale = manager
            .create_session("old.jpg", 8, Some(8))
            .await
            .expect("session");
        let fresh = manager
            .create_session("new.jpg", 8, Some(8))
            .await
            .expect("session");

        {
            let sessions = manager.sessions.read().await;
            let handle = sessions.get(&stale.id).cloned().expect("handle");
            drop(sessions);
            let mut session = handle.lock().await;
            session.created_at = OffsetDateTime::now_utc() - Duration::from_secs(7200);
        }

        let swept = manager.sweep_expired(Duration::from_secs(3600)).await;
        assert_eq!(swept, 1);
        assert!(manager.get_session(stale.id).await.is_none());
        assert!(manager.get_session(fresh.id).await.is_some());
    }
}
