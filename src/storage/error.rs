//! Common error types for storage operations

use std::io;

/// A common error type for persistence operations.
///
/// This enum defines the errors a [`Persistence`](super::Persistence)
/// backend can report. The protocol engine treats every variant as
/// non-retryable for the operation at hand; [`Error::Corrupt`] is the one
/// it recovers from, by discarding the affected record during restore.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum Error {
    /// An operation was attempted before `open` or after `close`.
    #[error("persistence store is not open")]
    NotOpen,
    /// An error occurred during a write operation.
    #[error("failed to write record {0}")]
    WriteError(String),
    /// An error occurred during a read operation.
    #[error("failed to read record {0}")]
    ReadError(String),
    /// The stored bytes for a key are truncated or fail their checksum.
    #[error("record {0} is corrupt")]
    Corrupt(String),
    /// The key is not valid for this backend.
    #[error("invalid record key {0:?}")]
    InvalidKey(String),
    /// Any other I/O failure reported by the operating system.
    #[error("i/o error ({kind:?}): {message}")]
    Io {
        /// Classification of the underlying I/O error.
        kind: io::ErrorKind,
        /// Human readable description.
        message: String,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
