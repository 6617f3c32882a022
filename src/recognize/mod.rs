//! Recognition and classification collaborators.
//!
//! The pipeline consumes two external engines through narrow traits: a text
//! recognizer that reads an optimized image, and a field classifier that
//! turns extracted text into structured fields. Recognition progress arrives
//! as events on an mpsc channel rather than a callback, so the stage driver
//! can consume updates on its own schedule. HTTP-backed adapters talk to the
//! engines configured by `SCANPIPE_RECOGNIZER_URL` / `SCANPIPE_CLASSIFIER_URL`.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

/// Confidence attached to a fallback classification when the classifier
/// engine is unavailable. Deliberately low so callers can distinguish
/// degraded results from real ones.
pub const FALLBACK_CONFIDENCE: f32 = 0.1;

/// Errors raised by text recognition engines.
#[derive(Debug, Error)]
pub enum RecognizerError {
    /// Engine could not be reached or rejected the request.
    #[error("recognition request failed: {0}")]
    Request(String),
    /// Source image could not be read from disk.
    #[error("failed to read image for recognition: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by classification engines. Callers treat these as
/// degradable, never fatal.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Engine could not be reached or rejected the request.
    #[error("classification request failed: {0}")]
    Request(String),
}

/// Structured fields extracted from recognized text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Coarse document category reported by the engine.
    pub document_type: String,
    /// Named fields pulled out of the text.
    pub fields: BTreeMap<String, String>,
    /// Engine confidence in `[0, 1]`.
    pub confidence: f32,
}

impl Classification {
    /// Degraded classification used when the engine fails; the raw text is
    /// still useful to the caller without structured fields.
    pub fn fallback() -> Self {
        Self {
            document_type: "unknown".to_string(),
            fields: BTreeMap::new(),
            confidence: FALLBACK_CONFIDENCE,
        }
    }
}

/// Interface implemented by text recognition backends.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    /// Extract text from the image at `image_path`, reporting fractional
    /// progress in `[0, 1]` on `progress` as work advances. Dropping the
    /// channel receiver must not fail the extraction.
    async fn extract_text(
        &self,
        image_path: &Path,
        progress: mpsc::Sender<f32>,
    ) -> Result<String, RecognizerError>;
}

/// Interface implemented by field classification backends.
#[async_trait]
pub trait FieldClassifier: Send + Sync {
    /// Derive structured fields and a confidence score from extracted text.
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

/// Recognizer backed by an HTTP engine exposing `POST /recognize`.
pub struct HttpRecognizer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRecognizer {
    /// Build a recognizer client for the engine at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct RecognizeRequest {
    image: String,
    filename: String,
}

#[derive(Deserialize)]
struct RecognizeResponse {
    text: String,
}

#[async_trait]
impl TextRecognizer for HttpRecognizer {
    async fn extract_text(
        &self,
        image_path: &Path,
        progress: mpsc::Sender<f32>,
    ) -> Result<String, RecognizerError> {
        let bytes = tokio::fs::read(image_path).await?;
        let filename = image_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracing::debug!(image = %image_path.display(), bytes = bytes.len(), "Dispatching recognition request");

        // The HTTP engine is single-shot, so progress is coarse: one event
        // once the payload is accepted, one when text comes back.
        let _ = progress.send(0.0).await;
        let response = self
            .client
            .post(format!("{}/recognize", self.base_url))
            .json(&RecognizeRequest {
                image: BASE64_STANDARD.encode(&bytes),
                filename,
            })
            .send()
            .await
            .map_err(|err| RecognizerError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(RecognizerError::Request(format!(
                "engine returned status {}",
                response.status()
            )));
        }

        let body: RecognizeResponse = response
            .json()
            .await
            .map_err(|err| RecognizerError::Request(err.to_string()))?;
        let _ = progress.send(1.0).await;
        Ok(body.text)
    }
}

/// Classifier backed by an HTTP engine exposing `POST /classify`.
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifier {
    /// Build a classifier client for the engine at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

#[async_trait]
impl FieldClassifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let response = self
            .client
            .post(format!("{}/classify", self.base_url))
            .json(&ClassifyRequest { text })
            .send()
            .await
            .map_err(|err| ClassifierError::Request(err.to_string()))?;

        if !response.status().is_success() {
            return Err(ClassifierError::Request(format!(
                "engine returned status {}",
                response.status()
            )));
        }

        let mut classification: Classification = response
            .json()
            .await
            .map_err(|err| ClassifierError::Request(err.to_string()))?;
        classification.confidence = classification.confidence.clamp(0.0, 1.0);
        Ok(classification)
    }
}
