use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use libmqtt::network::error::Error;
use libmqtt::network::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub mod broker;
mod protocol;

pub use broker::{BrokerConn, Listener};

/// How long a pipe read waits before reporting a timeout.
const READ_POLL: Duration = Duration::from_millis(20);

/// One direction of an in-memory connection.
#[derive(Debug)]
pub struct PipeInput {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl Read for PipeInput {
    type Error = Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.pending.is_empty() {
            match self.rx.try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(TryRecvError::Disconnected) => return Ok(0),
                Err(TryRecvError::Empty) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Err(Error::ConnectionClosed);
                    }
                    match self.rx.recv_timeout(READ_POLL) {
                        Ok(chunk) => self.pending = chunk,
                        Err(RecvTimeoutError::Timeout) => return Err(Error::Timeout),
                        Err(RecvTimeoutError::Disconnected) => return Ok(0),
                    }
                }
            }
        }
        let len = buf.len().min(self.pending.len());
        buf[..len].copy_from_slice(&self.pending[..len]);
        self.pending.drain(..len);
        Ok(len)
    }
}

/// The other direction of an in-memory connection.
#[derive(Debug)]
pub struct PipeOutput {
    tx: Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl Write for PipeOutput {
    type Error = Error;

    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.tx.send(buf.to_vec()).map_err(|_| Error::ConnectionClosed)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Both ends of a fresh connection sharing one `closed` flag.
fn connection() -> ((PipeInput, PipeOutput), (PipeInput, PipeOutput)) {
    let closed = Arc::new(AtomicBool::new(false));
    let (to_broker, from_client) = unbounded();
    let (to_client, from_broker) = unbounded();
    let client = (
        PipeInput {
            rx: from_broker,
            pending: Vec::new(),
            closed: closed.clone(),
        },
        PipeOutput {
            tx: to_broker,
            closed: closed.clone(),
        },
    );
    let broker = (
        PipeInput {
            rx: from_client,
            pending: Vec::new(),
            closed: closed.clone(),
        },
        PipeOutput { tx: to_client, closed },
    );
    (client, broker)
}

/// A [`Transport`] whose every `start` hands a new in-memory connection to
/// the paired [`Listener`].
#[derive(Debug)]
pub struct PipeTransport {
    accept: Sender<BrokerConn>,
    streams: Option<(PipeInput, PipeOutput)>,
    closed: Option<Arc<AtomicBool>>,
    refuse: bool,
}

/// A connected transport/listener pair.
pub fn pipe() -> (PipeTransport, Listener) {
    let (accept, accepted) = unbounded();
    let transport = PipeTransport {
        accept,
        streams: None,
        closed: None,
        refuse: false,
    };
    (transport, Listener::new(accepted))
}

impl PipeTransport {
    /// Make every connection attempt fail as if nothing were listening.
    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }
}

impl Transport for PipeTransport {
    type Input = PipeInput;
    type Output = PipeOutput;

    fn start(&mut self) -> Result<(), Error> {
        if self.refuse {
            return Err(Error::ConnectionRefused);
        }
        let (client, (input, output)) = connection();
        self.closed = Some(client.0.closed.clone());
        self.accept
            .send(BrokerConn::new(input, output))
            .map_err(|_| Error::ConnectionRefused)?;
        self.streams = Some(client);
        Ok(())
    }

    fn input_stream(&mut self) -> Result<PipeInput, Error> {
        let (input, output) = self.streams.take().ok_or(Error::NotOpen)?;
        let stream = PipeInput {
            rx: input.rx.clone(),
            pending: Vec::new(),
            closed: input.closed.clone(),
        };
        self.streams = Some((input, output));
        Ok(stream)
    }

    fn output_stream(&mut self) -> Result<PipeOutput, Error> {
        let (input, output) = self.streams.take().ok_or(Error::NotOpen)?;
        let stream = PipeOutput {
            tx: output.tx.clone(),
            closed: output.closed.clone(),
        };
        self.streams = Some((input, output));
        Ok(stream)
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.streams = None;
        if let Some(closed) = self.closed.take() {
            closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn server_uri(&self) -> String {
        "pipe://broker".to_string()
    }
}

#[test]
fn test_pipe_carries_bytes_both_ways() {
    let ((mut client_in, mut client_out), (mut broker_in, mut broker_out)) = connection();
    assert_eq!(client_out.write(&[1, 2, 3]), Ok(3));
    let mut buf = [0u8; 2];
    assert_eq!(broker_in.read(&mut buf), Ok(2));
    assert_eq!(buf, [1, 2]);
    assert_eq!(broker_in.read(&mut buf), Ok(1));
    assert_eq!(buf[0], 3);

    broker_out.write(&[9]).unwrap();
    assert_eq!(client_in.read(&mut buf), Ok(1));
    assert_eq!(buf[0], 9);
}

#[test]
fn test_pipe_read_times_out_when_idle() {
    let ((mut client_in, _client_out), _broker) = connection();
    let mut buf = [0u8; 4];
    assert_eq!(client_in.read(&mut buf), Err(Error::Timeout));
}

#[test]
fn test_pipe_drains_before_reporting_close() {
    let ((_client_in, mut client_out), (mut broker_in, _broker_out)) = connection();
    client_out.write(&[0xE0, 0x00]).unwrap();
    client_out.closed.store(true, Ordering::SeqCst);
    assert_eq!(client_out.write(&[1]), Err(Error::ConnectionClosed));

    let mut buf = [0u8; 4];
    assert_eq!(broker_in.read(&mut buf), Ok(2));
    assert_eq!(broker_in.read(&mut buf), Err(Error::ConnectionClosed));
}

#[test]
fn test_transport_requires_start() {
    let (mut transport, _listener) = pipe();
    assert_eq!(transport.input_stream().err(), Some(Error::NotOpen));
    transport.start().unwrap();
    assert!(transport.input_stream().is_ok());
    assert!(transport.output_stream().is_ok());
    transport.stop().unwrap();
    assert_eq!(transport.output_stream().err(), Some(Error::NotOpen));
}
