#![deny(missing_docs)]

//! Core library for the scanpipe upload and recognition service.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Asynchronous scan-job lifecycle engine.
pub mod job;
/// Structured logging and tracing setup.
pub mod logging;
/// Service activity counters.
pub mod metrics;
/// Fixed-window request admission control.
pub mod ratelimit;
/// Recognition and classification collaborator interfaces.
pub mod recognize;
/// Chunked upload session management.
pub mod upload;
