use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

/// Ceiling and window for one named admission policy.
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    /// Maximum requests admitted per window.
    pub max_count: u32,
    /// Fixed window length.
    pub window: Duration,
}

/// Runtime configuration for the scanpipe server.
///
/// Every option has a default so the server starts with an empty environment;
/// values are overridden through `SCANPIPE_`-prefixed variables.
#[derive(Debug)]
pub struct Config {
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Root directory for chunk files and reassembled artifacts.
    pub storage_dir: PathBuf,
    /// Maximum declared upload size in bytes.
    pub max_file_size: u64,
    /// Smallest accepted chunk size in bytes.
    pub min_chunk_size: u64,
    /// Largest accepted chunk size in bytes.
    pub max_chunk_size: u64,
    /// Chunk size applied when the client does not request one.
    pub default_chunk_size: u64,
    /// Admission policy for the upload endpoints.
    pub upload_rate: RatePolicy,
    /// Admission policy for the processing endpoint.
    pub process_rate: RatePolicy,
    /// Coarse per-client ceiling across all endpoints.
    pub global_rate: RatePolicy,
    /// Age past which an unfinished upload session is swept.
    pub session_max_age: Duration,
    /// Interval between background sweep passes.
    pub sweep_interval: Duration,
    /// Base URL of the external text recognition engine.
    pub recognizer_url: String,
    /// Base URL of the external field classification engine.
    pub classifier_url: String,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server_port: parse_optional("SCANPIPE_SERVER_PORT")?,
            storage_dir: load_optional("SCANPIPE_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| env::temp_dir().join("scanpipe")),
            max_file_size: parse_or("SCANPIPE_MAX_FILE_SIZE", 20 * 1024 * 1024)?,
            min_chunk_size: parse_or("SCANPIPE_MIN_CHUNK_SIZE", 1024)?,
            max_chunk_size: parse_or("SCANPIPE_MAX_CHUNK_SIZE", 5 * 1024 * 1024)?,
            default_chunk_size: parse_or("SCANPIPE_DEFAULT_CHUNK_SIZE", 512 * 1024)?,
            upload_rate: RatePolicy {
                max_count: parse_or("SCANPIPE_UPLOAD_RATE_MAX", 120)?,
                window: Duration::from_millis(parse_or("SCANPIPE_UPLOAD_RATE_WINDOW_MS", 60_000)?),
            },
            process_rate: RatePolicy {
                max_count: parse_or("SCANPIPE_PROCESS_RATE_MAX", 20)?,
                window: Duration::from_millis(parse_or(
                    "SCANPIPE_PROCESS_RATE_WINDOW_MS",
                    60_000,
                )?),
            },
            global_rate: RatePolicy {
                max_count: parse_or("SCANPIPE_GLOBAL_RATE_MAX", 300)?,
                window: Duration::from_millis(parse_or("SCANPIPE_GLOBAL_RATE_WINDOW_MS", 60_000)?),
            },
            session_max_age: Duration::from_secs(parse_or("SCANPIPE_SESSION_MAX_AGE_SECS", 3600)?),
            sweep_interval: Duration::from_secs(parse_or("SCANPIPE_SWEEP_INTERVAL_SECS", 300)?),
            recognizer_url: load_optional("SCANPIPE_RECOGNIZER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8800".to_string()),
            classifier_url: load_optional("SCANPIPE_CLASSIFIER_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8801".to_string()),
        })
    }
}

fn load_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match load_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        None => Ok(default),
    }
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_optional(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load config from environment");
    tracing::debug!(
        storage_dir = %config.storage_dir.display(),
        max_file_size = config.max_file_size,
        server_port = ?config.server_port,
        recognizer_url = %config.recognizer_url,
        "Loaded configuration"
    );
    CONFIG.set(config).expect("Failed to set config");
}
