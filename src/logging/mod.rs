//! Logging subsystem
//!
//! Structured logging via tracing with plaintext (development) and JSON
//! (production) output formats. The channel itself only emits events; embed
//! this initializer in binaries and tests that need a subscriber.
//!
//! # Environment Variables
//!
//! - `DIALBACK_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::env;
use std::io;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable plaintext
    #[default]
    Text,
    /// Newline-delimited JSON
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Level used when neither `DIALBACK_LOG` nor `RUST_LOG` is set
    pub default_level: Level,
}

impl LogConfig {
    /// Plaintext output at DEBUG level.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Text,
            default_level: Level::DEBUG,
        }
    }

    /// JSON output at INFO level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            default_level: Level::INFO,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::development()
    }
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
}

/// Install the global tracing subscriber. May only be called once per
/// process.
pub fn init_logging(config: LogConfig) -> Result<(), LogInitError> {
    let filter = env_filter(config.default_level)?;
    if INIT_GUARD.set(()).is_err() {
        return Err(LogInitError::AlreadyInitialized);
    }

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init(),
    }
    Ok(())
}

fn env_filter(default_level: Level) -> Result<EnvFilter, LogInitError> {
    match env::var("DIALBACK_LOG").or_else(|_| env::var("RUST_LOG")) {
        Ok(spec) => {
            EnvFilter::try_new(spec).map_err(|error| LogInitError::InvalidFilter(error.to_string()))
        }
        Err(_) => Ok(EnvFilter::default().add_directive(default_level.into())),
    }
}
