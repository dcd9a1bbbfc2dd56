//! # quizcache common
//!
//! Shared pieces for the quizcache workspace.
//!
//! ## Features
//!
//! - Error type for configuration, I/O and timeouts
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_when, retry_with_backoff, with_timeout, RetryConfig};

/// Error type shared across quizcache crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Io(_))
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Io(_) => "io",
            Error::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for quizcache operations.
pub type Result<T> = std::result::Result<T, Error>;
