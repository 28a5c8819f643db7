//! Errors raised while building connection pools.

use thiserror::Error;

/// Result type for pool construction.
pub type SourceResult<T> = Result<T, SourceError>;

/// Pool construction errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid pool configuration: {0}")]
    Config(String),

    #[error("driver error: {0}")]
    Driver(#[from] sqlx::Error),
}
