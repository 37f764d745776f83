//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem, supporting
//! human-readable and JSON output, configurable via environment variables
//! or programmatically.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info", "debug,stepforge=trace")
//! - `STEPFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `STEPFORGE_LOG_FORMAT`: Output format ("human" or "json")

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

/// Tracks whether a subscriber has already been installed
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVEL_ENV: &str = "STEPFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "STEPFORGE_LOG_FORMAT";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format string provided
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output (default)
    #[default]
    Human,
    /// JSON structured output
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Result<Self, LoggingError> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidLogFormat(other.to_string())),
        }
    }
}

fn level_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    match level.to_lowercase().as_str() {
        "error" | "warn" | "warning" | "info" | "debug" | "trace" => {
            Ok(EnvFilter::new(level.to_lowercase()))
        }
        other => Err(LoggingError::InvalidLogLevel(other.to_string())),
    }
}

/// Initialize logging from the environment
///
/// Safe to call more than once; later calls are no-ops. Precedence:
/// `RUST_LOG` over `STEPFORGE_LOG_LEVEL` over the default of `info`.
pub fn init_logging() -> Result<(), LoggingError> {
    let format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(value) => LogFormat::from_str(&value)?,
        Err(_) => LogFormat::default(),
    };
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match std::env::var(LOG_LEVEL_ENV) {
            Ok(level) => level_filter(&level)?,
            Err(_) => EnvFilter::new(DEFAULT_LOG_LEVEL),
        }
    };

    TRACING_INITIALIZED.get_or_init(|| {
        let builder = fmt().with_env_filter(filter).with_target(true);
        let result = match format {
            LogFormat::Human => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        // Another subscriber (e.g. a test harness) may already be
        // installed; that is fine.
        let _ = result;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_format_parsing() {
        assert_eq!(LogFormat::from_str("human").unwrap(), LogFormat::Human);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert!(LogFormat::from_str("xml").is_err());
    }

    #[test]
    fn test_level_validation() {
        assert!(level_filter("debug").is_ok());
        assert!(level_filter("WARN").is_ok());
        assert!(level_filter("loud").is_err());
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        assert!(init_logging().is_ok());
        assert!(init_logging().is_ok());
    }
}
