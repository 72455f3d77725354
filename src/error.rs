//! Error types for the Ratekeeper engine.

use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Malformed limits, key extraction or cost extraction. Fatal at activation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The external store could not be reached, or an operation timed out.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The atomic script was missing from the store even after reloading it.
    #[error("Script load error: {0}")]
    ScriptLoad(String),

    /// A single key or cost source could not be resolved.
    #[error("Extraction failure: {0}")]
    Extraction(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatekeeperError {
    /// Whether this error means the store could not produce a decision.
    ///
    /// Callers apply the configured failure mode to these.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            RatekeeperError::BackendUnavailable(_)
                | RatekeeperError::ScriptLoad(_)
                | RatekeeperError::Redis(_)
        )
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
