//! Common error types for network operations

use std::io;

/// A common error type for network operations.
///
/// This enum defines the errors a transport can report to the protocol
/// engine. [`Error::Timeout`] is special: it is the only variant the
/// engine treats as benign, because transports are expected to bound their
/// reads so that keep-alive and shutdown checks get a chance to run.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    #[error("connection is not open")]
    NotOpen,
    /// An error occurred during a write operation.
    #[error("write failed")]
    WriteError,
    /// An error occurred during a read operation.
    #[error("read failed")]
    ReadError,
    /// A connection attempt was refused.
    #[error("connection refused")]
    ConnectionRefused,
    /// A read or write did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,
    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// An invalid address was provided.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
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
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
            io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            kind => Error::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}
