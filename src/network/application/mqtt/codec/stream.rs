//! Packet framing on top of transport streams.

use std::mem;

use heapless::Vec as HeaplessVec;

use super::{Packet, PacketType, mbi};
use crate::network::application::mqtt::error::Error;
use crate::network::error::Error as NetworkError;
use crate::network::{Read, Write};

/// Payloads are written in slices of at most this many bytes, so the
/// outbound activity counter advances while a large message is in transit.
pub const WRITE_CHUNK_SIZE: usize = 1024;

/// The body buffer grows by at most this much per read, so a forged
/// remaining length cannot reserve memory the peer never sends.
const READ_CHUNK_SIZE: usize = 4096;

/// Consecutive write timeouts tolerated before the connection is given up.
pub const DEFAULT_WRITE_TIMEOUT_RETRIES: usize = 20;

/// Observer told how many bytes moved on each successful read or write.
pub type Progress = Box<dyn FnMut(usize) + Send>;

/// Reads whole packets from an input stream.
///
/// A read timeout never loses data: the partially read fixed header and
/// body are kept, and the next call to [`read_packet`](Self::read_packet)
/// resumes where the previous one stopped.
pub struct PacketReader<R> {
    input: R,
    header: HeaplessVec<u8, 5>,
    body: Vec<u8>,
    filled: usize,
    body_len: Option<usize>,
    progress: Option<Progress>,
}

impl<R> PacketReader<R>
where
    R: Read<Error = NetworkError>,
{
    /// Frame packets read from `input`.
    pub fn new(input: R) -> Self {
        Self {
            input,
            header: HeaplessVec::new(),
            body: Vec::new(),
            filled: 0,
            body_len: None,
            progress: None,
        }
    }

    /// Report every chunk of received bytes to `progress`.
    pub fn with_progress(mut self, progress: impl FnMut(usize) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Read the next packet.
    ///
    /// Returns `Ok(None)` if the stream timed out before a whole packet
    /// arrived; calling again continues the same packet. Any other failure
    /// is fatal to the connection and discards the partial packet.
    pub fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        match self.fill() {
            Ok(()) => {}
            Err(Error::Network(NetworkError::Timeout)) => return Ok(None),
            Err(e) => {
                self.reset();
                return Err(e);
            }
        }
        let first = self.header[0];
        let body = mem::take(&mut self.body);
        self.reset();
        Packet::decode_body(first, &body).map(Some)
    }

    /// Whether part of a packet has been read but not yet returned.
    pub fn is_mid_packet(&self) -> bool {
        !self.header.is_empty()
    }

    /// Give the stream back, dropping any partial packet.
    pub fn into_inner(self) -> R {
        self.input
    }

    fn fill(&mut self) -> Result<(), Error> {
        while self.body_len.is_none() {
            let mut byte = [0u8; 1];
            read_some(&mut self.input, &mut self.progress, &mut byte)?;
            self.header.push(byte[0]).map_err(|_| Error::MalformedLength)?;
            if self.header.len() == 1 {
                PacketType::from_byte(byte[0])?;
                continue;
            }
            if let Some((len, _)) = mbi::decode(&self.header[1..])? {
                self.body_len = Some(len);
                self.body = Vec::new();
                self.filled = 0;
            }
        }
        let len = self.body_len.unwrap_or_default();
        while self.filled < len {
            let end = len.min(self.filled + READ_CHUNK_SIZE);
            self.body.resize(end, 0);
            let n = read_some(&mut self.input, &mut self.progress, &mut self.body[self.filled..end])?;
            self.filled += n;
        }
        self.body.truncate(len);
        Ok(())
    }

    fn reset(&mut self) {
        self.header.clear();
        self.body = Vec::new();
        self.filled = 0;
        self.body_len = None;
    }
}

fn read_some<R>(input: &mut R, progress: &mut Option<Progress>, buf: &mut [u8]) -> Result<usize, Error>
where
    R: Read<Error = NetworkError>,
{
    let n = input.read(buf)?;
    if n == 0 {
        return Err(NetworkError::ConnectionClosed.into());
    }
    if let Some(progress) = progress {
        progress(n);
    }
    Ok(n)
}

/// Writes whole packets to an output stream.
pub struct PacketWriter<W> {
    output: W,
    progress: Option<Progress>,
    max_timeouts: usize,
}

impl<W> PacketWriter<W>
where
    W: Write<Error = NetworkError>,
{
    /// Write packets to `output`.
    pub fn new(output: W) -> Self {
        Self {
            output,
            progress: None,
            max_timeouts: DEFAULT_WRITE_TIMEOUT_RETRIES,
        }
    }

    /// Give up after `retries` consecutive write timeouts instead of
    /// [`DEFAULT_WRITE_TIMEOUT_RETRIES`].
    pub fn with_timeout_retries(mut self, retries: usize) -> Self {
        self.max_timeouts = retries;
        self
    }

    /// Report every chunk of sent bytes to `progress`.
    pub fn with_progress(mut self, progress: impl FnMut(usize) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Encode and write `packet`, then flush.
    ///
    /// The header goes out in one piece, the payload in
    /// [`WRITE_CHUNK_SIZE`] slices.
    pub fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
        let (header, payload) = packet.encode_parts()?;
        self.write_all(&header)?;
        for chunk in payload.chunks(WRITE_CHUNK_SIZE) {
            self.write_all(chunk)?;
        }
        self.output.flush()?;
        Ok(())
    }

    /// Give the stream back.
    pub fn into_inner(self) -> W {
        self.output
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<(), Error> {
        let mut timeouts = 0;
        while !buf.is_empty() {
            match self.output.write(buf) {
                Ok(0) => return Err(NetworkError::WriteError.into()),
                Ok(n) => {
                    if let Some(progress) = &mut self.progress {
                        progress(n);
                    }
                    buf = &buf[n..];
                    timeouts = 0;
                }
                Err(NetworkError::Timeout) if timeouts < self.max_timeouts => timeouts += 1,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
