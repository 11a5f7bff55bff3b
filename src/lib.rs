//! # libmqtt - durable MQTT client engine
//!
//! An MQTT 3.1 / 3.1.1 client that connects to a broker over any duplex
//! byte stream, publishes at QoS 0, 1 and 2, subscribes to topic filters
//! and receives messages, while surviving network interruptions and process
//! restarts without losing or duplicating messages beyond what each QoS
//! level permits.
//!
//! ## Features
//!
//! ### Protocol engine
//! - **Wire codec**: byte-exact encoding and decoding of all 14 control
//!   packets, with strict remaining-length and UTF-8 validation
//! - **Session state**: message identifier allocation, an in-flight window,
//!   QoS 1/2 handshakes and restore of persisted flows on restart
//! - **Threads**: a receiver, a sender and a callback dispatcher per client,
//!   so application callbacks never block the network
//!
//! ### Collaborators
//! - **Transports**: anything implementing [`network::Transport`]; plain TCP
//!   ships as [`network::tcp::TcpTransport`]
//! - **Persistence**: anything implementing [`storage::Persistence`];
//!   [`storage::MemoryPersistence`] and [`storage::FilePersistence`] ship
//!   with the crate
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libmqtt = "0.1.0"
//! ```
//!
//! ### Publishing with a file-backed session
//!
//! ```rust,no_run
//! use libmqtt::network::tcp::TcpTransport;
//! use libmqtt::storage::FilePersistence;
//! use libmqtt::{ConnectOptions, MqttClient, QoS};
//!
//! let transport = TcpTransport::new("broker.local:1883");
//! let persistence = FilePersistence::new("/var/lib/my-device/mqtt");
//! let client = MqttClient::new("device-7", transport, Box::new(persistence)).unwrap();
//!
//! let options = ConnectOptions {
//!     clean_session: false,
//!     ..Default::default()
//! };
//! client.connect(&options).unwrap();
//!
//! // Anything not yet acknowledged from a previous run is resent first.
//! for token in client.pending_delivery_tokens() {
//!     println!("resending message {}", token.message_id());
//! }
//!
//! client
//!     .publish("devices/7/state", b"on".to_vec(), QoS::ExactlyOnce, true)
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//! client.disconnect().unwrap();
//! ```
//!
//! ## Logging
//!
//! The engine logs through the [`log`] facade and never installs a logger.
//! Every line starts with the client id.

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]

/// Network abstraction layer: transports and the MQTT engine on top of them.
pub mod network;

/// Durable key/value storage for in-flight session state.
pub mod storage;

pub use network::application::mqtt::{
    Callback, ConnectOptions, Error, Message, MqttClient, MqttVersion, QoS, Token, WillOptions,
};
