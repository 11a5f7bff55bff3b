//! The application-facing client.
//!
//! # Examples
//!
//! ```rust,no_run
//! use libmqtt::network::tcp::TcpTransport;
//! use libmqtt::storage::MemoryPersistence;
//! use libmqtt::{Callback, ConnectOptions, Message, MqttClient, QoS};
//!
//! struct Print;
//!
//! impl Callback for Print {
//!     fn message_arrived(&mut self, topic: &str, message: &Message) {
//!         println!("{topic}: {} bytes", message.payload.len());
//!     }
//! }
//!
//! let transport = TcpTransport::new("localhost:1883");
//! let client = MqttClient::new("sensor-01", transport, Box::new(MemoryPersistence::new())).unwrap();
//! client.set_callback(Print);
//! client.connect(&ConnectOptions::default()).unwrap();
//!
//! client.subscribe(&[("commands/+", QoS::AtLeastOnce)]).unwrap();
//! let token = client.publish("sensors/temperature", b"23.5".to_vec(), QoS::AtLeastOnce, false).unwrap();
//! token.wait().unwrap();
//!
//! client.disconnect().unwrap();
//! client.close().unwrap();
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::callback::{Callback, CallbackDispatcher};
use super::codec::{Packet, Publish, QoS, SUBACK_FAILURE, Subscribe, Unsubscribe, utf8};
use super::comms::Comms;
use super::error::Error;
use super::options::ConnectOptions;
use super::state::ClientState;
use super::token::{Token, TokenStore};
use super::topic;
use crate::network::Transport;
use crate::storage::Persistence;

/// How long [`MqttClient::disconnect`] lets in-flight work finish.
pub const DEFAULT_QUIESCE_TIMEOUT: Duration = Duration::from_secs(30);

/// An MQTT client bound to one transport and one persistence store.
///
/// Calls may come from any thread, including from inside a [`Callback`],
/// with one exception: [`disconnect`](MqttClient::disconnect) fails with
/// [`Error::DisconnectProhibited`] on the callback thread.
pub struct MqttClient<T: Transport> {
    client_id: String,
    comms: Arc<Comms<T>>,
    time_to_wait: Option<Duration>,
}

impl<T: Transport> MqttClient<T> {
    /// Create a client and restore whatever session `persistence` holds
    /// for this client id and the transport's server.
    pub fn new(client_id: impl Into<String>, transport: T, persistence: Box<dyn Persistence>) -> Result<Self, Error> {
        let client_id = client_id.into();
        if client_id.len() > utf8::MAX_FIELD_LEN {
            return Err(Error::InvalidArgument("client id is too long".into()));
        }
        utf8::validate(&client_id)?;

        let tokens = Arc::new(TokenStore::new(client_id.clone()));
        let callbacks = Arc::new(CallbackDispatcher::new(client_id.clone()));
        let state = Arc::new(ClientState::new(
            client_id.clone(),
            transport.server_uri(),
            persistence,
            tokens,
            callbacks,
        )?);
        let comms = Comms::new(client_id.clone(), transport, state);
        log::debug!("{client_id}: client created for {}", comms.server_uri());
        Ok(Self {
            client_id,
            comms,
            time_to_wait: None,
        })
    }

    /// Identifier sent in CONNECT.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The broker this client talks to, as reported by its transport.
    pub fn server_uri(&self) -> String {
        self.comms.server_uri()
    }

    /// Install the application callback.
    pub fn set_callback(&self, callback: impl Callback + 'static) {
        self.comms.state().callbacks().set_callback(Box::new(callback));
    }

    /// Bound every blocking call on this client; `None` waits indefinitely.
    pub fn set_time_to_wait(&mut self, time_to_wait: Option<Duration>) {
        self.time_to_wait = time_to_wait;
    }

    /// Current bound on blocking calls.
    pub fn time_to_wait(&self) -> Option<Duration> {
        self.time_to_wait
    }

    /// Connect to the broker and wait for it to accept.
    ///
    /// The returned token is complete; its
    /// [`session_present`](Token::session_present) flag tells whether the
    /// broker resumed an earlier session.
    pub fn connect(&self, options: &ConnectOptions) -> Result<Token, Error> {
        if self.client_id.is_empty() && !options.clean_session {
            return Err(Error::InvalidArgument(
                "an empty client id requires a clean session".into(),
            ));
        }
        self.comms.connect(options)
    }

    /// Publish a message. Returns without waiting for the broker; the
    /// token completes when delivery does.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retained: bool) -> Result<Token, Error> {
        topic::validate_topic_name(topic)?;
        self.comms.check_connected()?;
        let mut publish = Publish::new(topic, payload, qos);
        publish.retain = retained;
        let token = Token::for_publish(&publish);
        self.comms.send(Packet::Publish(publish), token.clone())?;
        Ok(token)
    }

    /// Subscribe to `filters` and wait for SUBACK.
    ///
    /// Fails with [`Error::SubscribeFailed`] if the broker rejected any of
    /// the filters; the token still carries the per-filter return codes.
    pub fn subscribe(&self, filters: &[(&str, QoS)]) -> Result<Token, Error> {
        if filters.is_empty() {
            return Err(Error::InvalidArgument("no topic filters given".into()));
        }
        for (filter, _) in filters {
            topic::validate_topic_filter(filter)?;
        }
        self.comms.check_connected()?;
        let packet = Packet::Subscribe(Subscribe {
            message_id: 0,
            filters: filters.iter().map(|(f, q)| (f.to_string(), *q)).collect(),
        });
        let token = Token::new();
        self.comms.send(packet, token.clone())?;
        token.wait_timeout(self.time_to_wait)?;
        if token
            .granted_qos()
            .is_some_and(|codes| codes.contains(&SUBACK_FAILURE))
        {
            log::warn!("{}: broker rejected a subscription", self.client_id);
            return Err(Error::SubscribeFailed);
        }
        Ok(token)
    }

    /// Remove subscriptions and wait for UNSUBACK.
    pub fn unsubscribe(&self, filters: &[&str]) -> Result<Token, Error> {
        if filters.is_empty() {
            return Err(Error::InvalidArgument("no topic filters given".into()));
        }
        for filter in filters {
            topic::validate_topic_filter(filter)?;
        }
        self.comms.check_connected()?;
        let packet = Packet::Unsubscribe(Unsubscribe {
            message_id: 0,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        });
        let token = Token::new();
        self.comms.send(packet, token.clone())?;
        token.wait_timeout(self.time_to_wait)?;
        Ok(token)
    }

    /// Disconnect, giving in-flight work [`DEFAULT_QUIESCE_TIMEOUT`] to
    /// finish.
    pub fn disconnect(&self) -> Result<(), Error> {
        self.disconnect_with_timeout(DEFAULT_QUIESCE_TIMEOUT)
    }

    /// Disconnect, giving in-flight work up to `quiesce_timeout` to finish.
    /// Work still outstanding afterwards fails with
    /// [`Error::Disconnecting`]; persisted QoS 1 and 2 messages are kept
    /// for the next session unless it is a clean one.
    pub fn disconnect_with_timeout(&self, quiesce_timeout: Duration) -> Result<(), Error> {
        self.comms.disconnect(quiesce_timeout)
    }

    /// Drop the connection without sending DISCONNECT, so the broker
    /// publishes the will message if one was set.
    pub fn disconnect_forcibly(&self, quiesce_timeout: Duration) -> Result<(), Error> {
        self.comms.disconnect_forcibly(quiesce_timeout)
    }

    /// Whether the broker has accepted the connection and it is still up.
    pub fn is_connected(&self) -> bool {
        self.comms.is_connected()
    }

    /// Tokens of publishes still waiting for their acknowledgement,
    /// including those restored from persistence.
    pub fn pending_delivery_tokens(&self) -> Vec<Token> {
        self.comms.state().tokens().delivery_tokens()
    }

    /// Release the persistence store. The client cannot be reconnected.
    pub fn close(&self) -> Result<(), Error> {
        self.comms.close()
    }
}

impl<T: Transport> Drop for MqttClient<T> {
    fn drop(&mut self) {
        if self.comms.is_connected() {
            let _ = self.comms.disconnect_forcibly(Duration::ZERO);
        }
    }
}

impl<T: Transport> std::fmt::Debug for MqttClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("client_id", &self.client_id)
            .field("comms", &self.comms)
            .finish()
    }
}
