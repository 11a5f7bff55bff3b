//! MQTT 3.1 / 3.1.1 client engine.
//!
//! The engine is layered leaf to root:
//!
//! - [`codec`]: byte-exact encoding and decoding of the 14 control packets
//! - [`token`]: completion handles and the store correlating them with
//!   responses
//! - [`state`]: message identifiers, send queues, QoS 1/2 handshakes and
//!   durable-session restore
//! - receiver and sender threads moving packets between the transport and
//!   the session state
//! - [`callback`]: the dispatcher thread that runs application callbacks
//! - [`comms`]: connect, disconnect and shutdown
//! - [`client`]: the [`MqttClient`] facade
//!
//! Durable sessions rely on a [`Persistence`](crate::storage::Persistence)
//! store: every outbound QoS 1/2 publish is written before it is queued and
//! removed only once its handshake completes, so a client created over the
//! same store after a crash resends it with the DUP flag set.

/// Application callbacks and the dispatcher thread.
pub mod callback;

/// Application-facing client.
pub mod client;

/// Wire codec.
pub mod codec;

/// Connection lifecycle.
pub mod comms;

/// Engine error type.
pub mod error;

/// Connection options.
pub mod options;

mod receiver;
mod sender;

/// Session state.
pub mod state;

/// Completion tokens.
pub mod token;

/// Topic validation.
pub mod topic;

pub use callback::{Callback, Message};
pub use client::{DEFAULT_QUIESCE_TIMEOUT, MqttClient};
pub use codec::{ConnackCode, Packet, ProtocolVersion, QoS};
pub use error::{Error, ErrorKind};
pub use options::{ConnectOptions, MqttVersion, WillOptions};
pub use token::Token;
