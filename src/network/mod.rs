//! A network abstraction layer for the MQTT engine
//!
//! The protocol engine never opens sockets itself. It consumes a
//! [`Transport`], which hands out one input stream (read by the receiver
//! thread) and one output stream (written by the sender thread). Any duplex
//! byte stream can be plugged in this way: a plain TCP socket
//! ([`tcp::TcpTransport`]), a TLS session produced by an external factory, or
//! an in-memory pipe in tests.
//!
//! Streams speak the small [`Read`] / [`Write`] traits below rather than
//! `std::io` directly, so that a transport can state precisely which
//! failures are timeouts ([`error::Error::Timeout`]) and which are fatal.

#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// Application layer protocol implementations.
pub mod application;

/// TCP transport built on `std::net`.
pub mod tcp;

/// Re-exports of common traits
pub mod prelude {
    pub use super::{Read, Transport, Write};
}

/// Reading half of a transport.
pub trait Read {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Read data from the connection.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the
    /// stream. A read that gives up because its timeout elapsed must report
    /// a timeout error instead of `Ok(0)`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// Writing half of a transport.
pub trait Write {
    /// Associated error type
    type Error: core::fmt::Debug;
    /// Write data to the connection
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error>;
    /// Flush the write buffer
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// A duplex byte-stream connection to a broker.
///
/// The engine calls [`start`](Transport::start) once per connection
/// attempt, then takes both streams and moves them to its receiver and
/// sender threads. [`stop`](Transport::stop) must unblock any thread parked
/// in a read or write on those streams; the engine relies on this during
/// shutdown.
pub trait Transport: Send + 'static {
    /// Stream handed to the receiver thread.
    type Input: Read<Error = error::Error> + Send + 'static;
    /// Stream handed to the sender thread.
    type Output: Write<Error = error::Error> + Send + 'static;

    /// Establish the underlying connection.
    fn start(&mut self) -> Result<(), error::Error>;

    /// Take the stream the engine reads broker packets from.
    fn input_stream(&mut self) -> Result<Self::Input, error::Error>;

    /// Take the stream the engine writes client packets to.
    fn output_stream(&mut self) -> Result<Self::Output, error::Error>;

    /// Tear the connection down.
    fn stop(&mut self) -> Result<(), error::Error>;

    /// Identifies the broker, e.g. `tcp://host:1883`. Used to scope
    /// persisted session state.
    fn server_uri(&self) -> String;
}
