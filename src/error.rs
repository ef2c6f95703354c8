//! Error types for the Carib rate limiter.

use thiserror::Error;

/// Main error type for rate limiting operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// The window store could not be reached, or a transaction could not be
    /// committed after the store's internal retries.
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(String),

    /// A limit configuration that can never be enforced.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfiguration(String),

    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether the error should be treated as a store outage.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RateLimitError::StoreUnavailable(_))
    }

    /// Reclassify a storage backend failure as a store outage.
    pub fn into_store_unavailable(self) -> Self {
        match self {
            RateLimitError::StoreUnavailable(_) => self,
            other => RateLimitError::StoreUnavailable(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
