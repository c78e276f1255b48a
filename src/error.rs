//! Error types for Turnstile.
//!
//! Only configuration and startup failures surface as [`TurnstileError`].
//! Per-request failures are absorbed by the limiter, and counting store
//! failures use [`crate::ratelimit::StoreError`].

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Malformed rule or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule path marked as a pattern failed to compile
    #[error("Invalid path pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Rule file parse errors
    #[error("Failed to parse rules: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
