//! CLI error types.

use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// The cache rejected an operation.
    #[error("cache error: {0}")]
    Cache(#[from] fieldcache::CacheError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
