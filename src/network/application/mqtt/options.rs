//! Connection options.

use std::time::Duration;

use serde::Deserialize;

use super::codec::{LastWill, ProtocolVersion, QoS};
use super::error::Error;
use super::topic;

/// Protocol level to announce in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum MqttVersion {
    /// Try 3.1.1 first, then 3.1 if the broker rejects the protocol level.
    #[default]
    Default,
    /// MQTT 3.1 only.
    V31,
    /// MQTT 3.1.1 only.
    V311,
}

impl MqttVersion {
    /// Level to try first.
    pub(crate) fn first_attempt(self) -> ProtocolVersion {
        match self {
            MqttVersion::V31 => ProtocolVersion::V31,
            MqttVersion::Default | MqttVersion::V311 => ProtocolVersion::V311,
        }
    }
}

/// Will message settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WillOptions {
    /// Topic the will is published to.
    pub topic: String,
    /// Will message body.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// QoS the broker publishes the will with.
    #[serde(default)]
    pub qos: QoS,
    /// Whether the broker retains the will.
    #[serde(default)]
    pub retained: bool,
}

impl From<&WillOptions> for LastWill {
    fn from(will: &WillOptions) -> Self {
        LastWill {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retained,
        }
    }
}

/// Settings for one connection attempt.
///
/// Every field has a default, so a JSON document only needs to name what
/// it changes:
///
/// ```rust
/// use libmqtt::ConnectOptions;
///
/// let options = ConnectOptions::from_json(r#"{"keep_alive_interval":15,"clean_session":false}"#).unwrap();
/// assert_eq!(options.keep_alive_interval, 15);
/// assert_eq!(options.max_inflight, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    /// Seconds of silence after which a PINGREQ is sent; 0 disables pings.
    pub keep_alive_interval: u16,
    /// Discard any previous session state on connect and disconnect.
    pub clean_session: bool,
    /// Seconds to wait for CONNACK; 0 waits indefinitely.
    pub connection_timeout: u32,
    /// Maximum number of unacknowledged QoS 1 and 2 publishes.
    pub max_inflight: usize,
    /// Capacity of the queue between the network and the application
    /// callback.
    pub inbound_queue_depth: usize,
    /// Protocol level to connect with.
    pub mqtt_version: MqttVersion,
    /// User name for authentication.
    pub username: Option<String>,
    /// Password; requires a user name.
    pub password: Option<String>,
    /// Message the broker publishes if this client vanishes.
    pub will: Option<WillOptions>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: 60,
            clean_session: true,
            connection_timeout: 30,
            max_inflight: 10,
            inbound_queue_depth: 10,
            mqtt_version: MqttVersion::Default,
            username: None,
            password: None,
            will: None,
        }
    }
}

impl ConnectOptions {
    /// Parse options from a JSON object.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let (options, _): (Self, usize) = serde_json_core::from_str(json)
            .map_err(|e| Error::InvalidArgument(format!("connect options: {e:?}")))?;
        options.validate()?;
        Ok(options)
    }

    /// Check the options for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_inflight == 0 {
            return Err(Error::InvalidArgument("max_inflight must be at least 1".into()));
        }
        if self.inbound_queue_depth == 0 {
            return Err(Error::InvalidArgument(
                "inbound_queue_depth must be at least 1".into(),
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidArgument("password given without a username".into()));
        }
        if let Some(will) = &self.will {
            topic::validate_topic_name(&will.topic)?;
        }
        Ok(())
    }

    /// Keep-alive interval, `None` when disabled.
    pub fn keep_alive(&self) -> Option<Duration> {
        match self.keep_alive_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs.into())),
        }
    }

    /// Bound on waiting for CONNACK, `None` to wait indefinitely.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.connection_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs.into())),
        }
    }
}
