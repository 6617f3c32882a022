use scanpipe::api::{self, AppState, RateLimiters};
use scanpipe::job::JobEngine;
use scanpipe::metrics::ServiceMetrics;
use scanpipe::ratelimit::RateLimiter;
use scanpipe::recognize::{HttpClassifier, HttpRecognizer};
use scanpipe::upload::{SessionManager, UploadLimits};
use scanpipe::{config, logging};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    config::init_config();
    logging::init_tracing();

    let state = build_state().await.expect("Failed to initialize service state");
    spawn_sweeper(Arc::clone(&state));
    let app = api::create_router(state);

    let (listener, port) = bind_listener().await.expect("Failed to bind listener");
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    axum::serve(listener, app).await.unwrap();
}

async fn build_state() -> Result<Arc<AppState>, std::io::Error> {
    let config = config::get_config();
    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let sessions = Arc::new(SessionManager::new(
        &config.storage_dir,
        UploadLimits {
            max_file_size: config.max_file_size,
            min_chunk_size: config.min_chunk_size,
            max_chunk_size: config.max_chunk_size,
            default_chunk_size: config.default_chunk_size,
        },
    ));
    let metrics = Arc::new(ServiceMetrics::new());
    let jobs = Arc::new(JobEngine::new(
        Arc::new(HttpRecognizer::new(config.recognizer_url.clone())),
        Arc::new(HttpClassifier::new(config.classifier_url.clone())),
        Arc::clone(&metrics),
    ));

    Ok(Arc::new(AppState {
        sessions,
        jobs,
        limiters: RateLimiters {
            global: RateLimiter::new("global", config.global_rate),
            upload: RateLimiter::new("upload", config.upload_rate),
            process: RateLimiter::new("process", config.process_rate),
        },
        metrics,
    }))
}

/// Periodically sweep abandoned upload sessions and expired limiter windows
/// to bound memory and disk growth.
fn spawn_sweeper(state: Arc<AppState>) {
    let config = config::get_config();
    let max_age = config.session_max_age;
    let mut ticker = tokio::time::interval(config.sweep_interval);
    tokio::spawn(async move {
        ticker.tick().await; // first tick fires immediately
        loop {
            ticker.tick().await;
            let swept = state.sessions.sweep_expired(max_age).await;
            tracing::debug!(swept, "Sweep pass finished");
            state.limiters.global.prune();
            state.limiters.upload.prune();
            state.limiters.process.prune();
        }
    });
}

async fn bind_listener() -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    let config = config::get_config();
    if let Some(port) = config.server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 8200..=8299;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 8200-8299",
    ))
}
