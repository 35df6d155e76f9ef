//! Errors raised while reading or writing digest records.

use thiserror::Error;

/// Failure of a [`DigestRepository`](super::DigestRepository) operation.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("digest log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("digest record encoding failed: {0}")]
    Serialization(String),

    #[error("digest log already exists: {0}")]
    LogAlreadyExists(String),

    #[error("truncated record at offset {offset}: expected {expected} bytes, found {actual}")]
    Truncated {
        offset: u64,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
