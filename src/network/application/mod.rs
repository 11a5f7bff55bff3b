//! # Application layer protocols
//!
//! Protocol engines that run on top of a [`Transport`](crate::network::Transport).
//!
//! - **[`mqtt`]**: MQTT 3.1 / 3.1.1 client with QoS 0/1/2 delivery and
//!   durable sessions

/// MQTT client implementation.
///
/// Provides a threaded MQTT 3.1/3.1.1 client whose QoS 1 and 2 flows
/// survive network failures and process restarts.
pub mod mqtt;
