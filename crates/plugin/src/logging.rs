//! Log sink setup
//!
//! Logs go to `Data/EarlyHook/Logs/earlyhook.log` beside the host executable.
//! The host usually has no console, so stderr is only a fallback.

use std::fs::File;
use std::sync::Mutex;

use earlyhook_core::config::log_file_path;
use earlyhook_core::CoreConfig;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured filter
pub const LOG_ENV: &str = "EARLYHOOK_LOG";

/// Filter from `EARLYHOOK_LOG`, or the configured level
pub fn filter(config: &CoreConfig) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install the global subscriber; later calls are no-ops
pub fn init(config: &CoreConfig) {
    match open_log_file() {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter(config))
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter(config))
                .with_writer(std::io::stderr)
                .try_init();
            tracing::warn!("Failed to open log file, logging to stderr: {}", e);
        }
    }
}

fn open_log_file() -> std::io::Result<File> {
    let path = log_file_path().map_err(std::io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(path)
}
