//! # Durable session storage
//!
//! This module defines the key/value [`Persistence`] interface the protocol
//! engine uses to keep QoS 1 and QoS 2 flows alive across network failures
//! and process restarts, together with two backends:
//!
//! - [`MemoryPersistence`]: records live in memory. Clones share the same
//!   records, which makes it a convenient way to hand "the same disk" to a
//!   second client instance.
//! - [`FilePersistence`]: one directory per client/server pair, one file
//!   per record, each protected by a CRC-32 trailer.
//!
//! # Record keys
//!
//! The engine owns the key space and uses three prefixes:
//!
//! | Key        | Contents                                        |
//! |------------|-------------------------------------------------|
//! | `s-<id>`   | an outbound PUBLISH (QoS 1 or 2) awaiting ack   |
//! | `sc-<id>`  | the PUBREL confirming an outbound QoS 2 PUBLISH |
//! | `r-<id>`   | an inbound QoS 2 PUBLISH awaiting its PUBREL    |
//!
//! Backends must treat keys as opaque strings.
//!
//! # Record layout
//!
//! A [`Record`] is split the same way the packet is on the wire: the
//! `header` holds the fixed header and variable header, the `payload` holds
//! the rest. Concatenating them yields a frame the network decoder accepts.
//!
//! ```rust
//! use libmqtt::storage::{MemoryPersistence, Persistence, Record};
//!
//! let mut store = MemoryPersistence::new();
//! store.open("client-1", "tcp://localhost:1883").unwrap();
//! store.put("s-1", &Record::new(vec![0x32, 0x07], vec![1, 2, 3])).unwrap();
//! assert!(store.contains_key("s-1").unwrap());
//! assert_eq!(store.keys().unwrap(), vec!["s-1".to_string()]);
//! ```

#![deny(unsafe_code)]

/// Common error types for storage operations
pub mod error;

mod file;
mod memory;


pub use error::Error;
pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Re-exports of common traits for convenient importing
pub mod prelude {
    pub use super::{Persistence, Record};
}

/// A persisted wire message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Fixed header plus variable header bytes.
    pub header: Vec<u8>,
    /// Payload bytes, possibly empty.
    pub payload: Vec<u8>,
}

impl Record {
    /// Build a record from its two halves.
    pub fn new(header: Vec<u8>, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// The record as one contiguous frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.header.len() + self.payload.len());
        bytes.extend_from_slice(&self.header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Key/value store for in-flight protocol state.
///
/// The protocol engine serialises every call through its session lock, so
/// implementations only need to be `Send`, not internally synchronised.
/// All operations other than `open` must fail with [`Error::NotOpen`] when
/// the store is closed.
pub trait Persistence: Send {
    /// Prepare the store for the given client/server pair. Reopening an
    /// already open store is allowed and must keep its records.
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), Error>;

    /// Release the store. Records must survive a close.
    fn close(&mut self) -> Result<(), Error>;

    /// Insert or replace the record stored under `key`.
    fn put(&mut self, key: &str, record: &Record) -> Result<(), Error>;

    /// Fetch the record stored under `key`, or `None` if there is none.
    fn get(&mut self, key: &str) -> Result<Option<Record>, Error>;

    /// Delete the record stored under `key`. Removing a missing key is not
    /// an error.
    fn remove(&mut self, key: &str) -> Result<(), Error>;

    /// Whether a record exists for `key`.
    fn contains_key(&mut self, key: &str) -> Result<bool, Error>;

    /// All keys currently stored, in no particular order.
    fn keys(&mut self) -> Result<Vec<String>, Error>;

    /// Delete every record.
    fn clear(&mut self) -> Result<(), Error>;
}

impl<P: Persistence + ?Sized> Persistence for Box<P> {
    fn open(&mut self, client_id: &str, server_uri: &str) -> Result<(), Error> {
        (**self).open(client_id, server_uri)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }

    fn put(&mut self, key: &str, record: &Record) -> Result<(), Error> {
        (**self).put(key, record)
    }

    fn get(&mut self, key: &str) -> Result<Option<Record>, Error> {
        (**self).get(key)
    }

    fn remove(&mut self, key: &str) -> Result<(), Error> {
        (**self).remove(key)
    }

    fn contains_key(&mut self, key: &str) -> Result<bool, Error> {
        (**self).contains_key(key)
    }

    fn keys(&mut self) -> Result<Vec<String>, Error> {
        (**self).keys()
    }

    fn clear(&mut self) -> Result<(), Error> {
        (**self).clear()
    }
}
