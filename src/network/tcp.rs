//! Plain TCP transport.

use std::io::{Read as StdRead, Write as StdWrite};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use super::error::Error;
use super::{Read, Transport, Write};

/// Read timeout applied to the socket so the receiver thread wakes up
/// regularly even when the broker is silent.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A [`Transport`] over a single TCP connection.
///
/// ```rust,no_run
/// use libmqtt::network::tcp::TcpTransport;
/// use std::time::Duration;
///
/// let transport = TcpTransport::new("localhost:1883")
///     .with_connect_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug)]
pub struct TcpTransport {
    address: String,
    connect_timeout: Option<Duration>,
    read_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Create a transport for `host:port`. Nothing is opened until
    /// [`Transport::start`].
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: None,
            read_timeout: DEFAULT_READ_TIMEOUT,
            stream: None,
        }
    }

    /// Bound the TCP handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Change the socket read timeout. Must be non-zero.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.read_timeout = timeout;
        }
        self
    }

    fn connected_stream(&self) -> Result<&TcpStream, Error> {
        self.stream.as_ref().ok_or(Error::NotOpen)
    }
}

impl Transport for TcpTransport {
    type Input = TcpInput;
    type Output = TcpOutput;

    fn start(&mut self) -> Result<(), Error> {
        let stream = match self.connect_timeout {
            Some(timeout) => {
                let addr = self
                    .address
                    .to_socket_addrs()
                    .map_err(|_| Error::InvalidAddress(self.address.clone()))?
                    .next()
                    .ok_or_else(|| Error::InvalidAddress(self.address.clone()))?;
                TcpStream::connect_timeout(&addr, timeout)?
            }
            None => TcpStream::connect(self.address.as_str())?,
        };
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_nodelay(true)?;
        log::debug!("tcp: connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    fn input_stream(&mut self) -> Result<TcpInput, Error> {
        let stream = self.connected_stream()?.try_clone()?;
        Ok(TcpInput { stream })
    }

    fn output_stream(&mut self) -> Result<TcpOutput, Error> {
        let stream = self.connected_stream()?.try_clone()?;
        Ok(TcpOutput { stream })
    }

    fn stop(&mut self) -> Result<(), Error> {
        if let Some(stream) = self.stream.take() {
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => {}
                // Already torn down by the peer.
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn server_uri(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Receiving half of a [`TcpTransport`].
#[derive(Debug)]
pub struct TcpInput {
    stream: TcpStream,
}

impl Read for TcpInput {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.stream.read(buf).map_err(Error::from)
    }
}

/// Sending half of a [`TcpTransport`].
#[derive(Debug)]
pub struct TcpOutput {
    stream: TcpStream,
}

impl Write for TcpOutput {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.stream.flush().map_err(Error::from)
    }
}
