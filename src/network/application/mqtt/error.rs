//! Error type of the MQTT engine.

use crate::network::error::Error as NetworkError;
use crate::storage::error::Error as StorageError;

use super::codec::ConnackCode;

/// Broad classification of an [`Error`].
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Malformed or unexpected data on the wire.
    Protocol,
    /// The transport failed.
    Io,
    /// Something did not happen in time.
    Timeout,
    /// The request is not valid in the client's current state.
    State,
    /// The persistence store failed.
    Persistence,
    /// The broker refused the connection or a subscription.
    Refused,
}

/// Errors reported by the MQTT engine.
///
/// Errors are `Clone` because one root cause is routinely delivered to
/// many waiters, e.g. every token outstanding when the connection drops.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum Error {
    /// The transport reported an error.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    /// The persistence store reported an error.
    #[error("persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// A remaining-length field ran past four digits or above 268,435,455.
    #[error("malformed remaining length")]
    MalformedLength,
    /// The packet type nibble does not name a known packet.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    /// The packet body does not match its declared layout.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// A string is not legal MQTT UTF-8, a topic is malformed, or a value is
    /// out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker answered CONNECT with a non-zero return code.
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnackCode),
    /// The broker rejected a subscription (SUBACK return code 0x80).
    #[error("subscription rejected by broker")]
    SubscribeFailed,

    /// A wait on a token ran out of time. The request may still complete.
    #[error("timed out waiting for a response")]
    ClientTimeout,
    /// Keep-alive expired again while a ping was already outstanding.
    #[error("broker did not answer keep-alive ping")]
    KeepAliveTimeout,

    /// The client is not connected.
    #[error("client is not connected")]
    NotConnected,
    /// The client is already connected.
    #[error("client is already connected")]
    AlreadyConnected,
    /// A connect attempt is in progress.
    #[error("connect already in progress")]
    ConnectInProgress,
    /// The client is disconnecting and no longer accepts this request.
    #[error("client is disconnecting")]
    Disconnecting,
    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,
    /// `disconnect` was called from inside a callback.
    #[error("disconnect is not allowed from a callback")]
    DisconnectProhibited,
    /// Every message identifier is in use.
    #[error("no message identifiers available")]
    NoMessageIdsAvailable,
    /// The connection dropped before the request completed.
    #[error("connection lost")]
    ConnectionLost,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Network(NetworkError::Timeout) => ErrorKind::Timeout,
            Error::Network(_) | Error::ConnectionLost => ErrorKind::Io,
            Error::Persistence(_) => ErrorKind::Persistence,
            Error::MalformedLength
            | Error::UnknownPacketType(_)
            | Error::MalformedPacket(_)
            | Error::InvalidArgument(_) => ErrorKind::Protocol,
            Error::ConnectionRefused(_) | Error::SubscribeFailed => ErrorKind::Refused,
            Error::ClientTimeout | Error::KeepAliveTimeout => ErrorKind::Timeout,
            Error::NotConnected
            | Error::AlreadyConnected
            | Error::ConnectInProgress
            | Error::Disconnecting
            | Error::ClientClosed
            | Error::DisconnectProhibited
            | Error::NoMessageIdsAvailable => ErrorKind::State,
        }
    }

    /// Whether the error ends the connection it occurred on.
    ///
    /// A read timeout is not fatal, nor is an expired wait on a token.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Network(NetworkError::Timeout) => false,
            Error::Network(_)
            | Error::MalformedLength
            | Error::UnknownPacketType(_)
            | Error::MalformedPacket(_)
            | Error::KeepAliveTimeout
            | Error::NoMessageIdsAvailable
            | Error::ConnectionLost
            | Error::ConnectionRefused(_) => true,
            _ => false,
        }
    }
}
