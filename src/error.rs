//! Build-time error types.
//!
//! Everything in this enum is a configuration problem: it is detected while
//! compiling policies or loading files at startup and never occurs mid-flight.
//! Runtime failure modes live with their components (`ratelimit::StoreError`,
//! `locking::LockError`, `locking::ExecuteError`).

use thiserror::Error;

/// Errors raised while loading configuration or compiling policies.
#[derive(Error, Debug)]
pub enum Error {
    /// Two rules were configured for the same route pattern and method.
    #[error("duplicate rate limit rule for pattern {pattern:?} method {method:?}")]
    DuplicateRule { pattern: String, method: String },

    /// A rule referenced a key strategy that is not in the registry.
    #[error("unknown key strategy {0:?}")]
    UnknownKeyStrategy(String),

    /// A rule was configured with a zero-length window.
    #[error("zero window for pattern {pattern:?} method {method:?}")]
    ZeroWindow { pattern: String, method: String },

    /// Configuration file could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for build-time operations.
pub type Result<T> = std::result::Result<T, Error>;
