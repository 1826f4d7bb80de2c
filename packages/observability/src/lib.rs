//! # Observability
//!
//! Logging setup shared by the MQ notifier crates.
//!
//! Libraries only use `tracing` macros. Binaries call
//! [`init_with_config`] once at startup to decide where events go:
//!
//! - compact human-readable lines on stderr
//! - JSONL (one object per event) appended to `log_path`, when set
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "mq-notifier".into(),
//!     default_level: "debug".into(),
//!     also_stderr: true,
//!     ..Default::default()
//! });
//! ```

mod file;
mod json_layer;

pub use file::LogFileWriter;
pub use json_layer::{JsonLayer, LogRecord};

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name written into every JSONL record.
    pub service_name: String,

    /// Default filter (e.g. "debug", "info,lapin=warn").
    /// Overridden by `RUST_LOG`.
    pub default_level: String,

    /// JSONL output file. No file output when unset.
    pub log_path: Option<PathBuf>,

    /// Also emit compact logs to stderr. Always on without `log_path`.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with default settings.
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging. Falls back to stderr only when the log file cannot be
/// opened.
pub fn init_with_config(config: LogConfig) {
    if let Err(e) = try_init_with_config(config.clone()) {
        let fallback = LogConfig {
            log_path: None,
            ..config
        };
        if try_init_with_config(fallback).is_ok() {
            tracing::warn!(error = %e, "Log file unavailable, logging to stderr only");
        }
    }
}

/// Initialize logging, reporting file or subscriber errors.
pub fn try_init_with_config(config: LogConfig) -> io::Result<()> {
    let json_layer = match &config.log_path {
        Some(path) => {
            let writer = LogFileWriter::open(path)?;
            Some(
                JsonLayer::new(config.service_name.clone(), writer)
                    .with_filter(env_filter(&config.default_level)),
            )
        }
        None => None,
    };

    let stderr_layer = (config.also_stderr || config.log_path.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
            .with_filter(env_filter(&config.default_level))
    });

    tracing_subscriber::registry()
        .with(json_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))?;

    if let Some(path) = &config.log_path {
        tracing::info!(log_path = %path.display(), "Logging initialized");
    }
    Ok(())
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, trace, warn};
