//! MQTT 3.1 / 3.1.1 wire codec.
//!
//! Every control packet is represented by one variant of the closed
//! [`Packet`] enum. Encoding and decoding are pure functions over byte
//! buffers; the only I/O-aware pieces are [`PacketReader`] and
//! [`PacketWriter`], which frame packets on top of a transport stream.
//!
//! ```text
//!  bit    7   6   5   4   3   2   1   0
//!       +---------------+---------------+
//!  byte1| packet type   | flags         |
//!       +---------------+---------------+
//!  byte2| remaining length, 1-4 bytes   |
//!   ... | variable header               |
//!   ... | payload                       |
//! ```

pub mod mbi;
pub mod packet;
pub mod stream;
pub mod utf8;

pub use packet::{Connack, Connect, LastWill, Packet, Publish, Suback, Subscribe, Unsubscribe};
pub use stream::{DEFAULT_WRITE_TIMEOUT_RETRIES, PacketReader, PacketWriter, WRITE_CHUNK_SIZE};

use serde::Deserialize;

use super::error::Error;

/// MQTT control packet types, as carried in the high nibble of byte 1.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client request to connect.
    Connect = 1,
    /// Connect acknowledgement.
    Connack = 2,
    /// Application message.
    Publish = 3,
    /// QoS 1 publish acknowledgement.
    Puback = 4,
    /// QoS 2 publish received.
    Pubrec = 5,
    /// QoS 2 publish release.
    Pubrel = 6,
    /// QoS 2 publish complete.
    Pubcomp = 7,
    /// Subscribe request.
    Subscribe = 8,
    /// Subscribe acknowledgement.
    Suback = 9,
    /// Unsubscribe request.
    Unsubscribe = 10,
    /// Unsubscribe acknowledgement.
    Unsuback = 11,
    /// Keep-alive ping request.
    Pingreq = 12,
    /// Keep-alive ping response.
    Pingresp = 13,
    /// Client is disconnecting.
    Disconnect = 14,
}

impl PacketType {
    /// Decode the type from the first byte of a fixed header.
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        Ok(match byte >> 4 {
            1 => Self::Connect,
            2 => Self::Connack,
            3 => Self::Publish,
            4 => Self::Puback,
            5 => Self::Pubrec,
            6 => Self::Pubrel,
            7 => Self::Pubcomp,
            8 => Self::Subscribe,
            9 => Self::Suback,
            10 => Self::Unsubscribe,
            11 => Self::Unsuback,
            12 => Self::Pingreq,
            13 => Self::Pingresp,
            14 => Self::Disconnect,
            other => return Err(Error::UnknownPacketType(other)),
        })
    }
}

/// Quality of Service levels.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Deserialize)]
#[serde(try_from = "u8")]
pub enum QoS {
    /// **QoS 0**: at most once. Fire and forget.
    #[default]
    AtMostOnce = 0,
    /// **QoS 1**: at least once. Acknowledged with PUBACK, may duplicate.
    AtLeastOnce = 1,
    /// **QoS 2**: exactly once, via PUBREC / PUBREL / PUBCOMP.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(Error::InvalidArgument(format!("QoS must be 0, 1 or 2, got {value}"))),
        }
    }
}

impl core::fmt::Display for QoS {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// CONNACK return codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackCode {
    /// Connection accepted.
    Accepted = 0,
    /// The broker does not speak the requested protocol level.
    UnacceptableProtocolVersion = 1,
    /// The client identifier is not allowed.
    IdentifierRejected = 2,
    /// The MQTT service is unavailable.
    ServerUnavailable = 3,
    /// Malformed user name or password.
    BadUserNameOrPassword = 4,
    /// The client is not authorized to connect.
    NotAuthorized = 5,
}

impl ConnackCode {
    /// Map a CONNACK return code; `None` for reserved values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Accepted),
            1 => Some(Self::UnacceptableProtocolVersion),
            2 => Some(Self::IdentifierRejected),
            3 => Some(Self::ServerUnavailable),
            4 => Some(Self::BadUserNameOrPassword),
            5 => Some(Self::NotAuthorized),
            _ => None,
        }
    }
}

/// Protocol level announced in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1, protocol name `MQIsdp`, level 3.
    V31,
    /// MQTT 3.1.1, protocol name `MQTT`, level 4.
    #[default]
    V311,
}

impl ProtocolVersion {
    /// Protocol name written in CONNECT.
    pub fn name(self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    /// Protocol level byte written in CONNECT.
    pub fn level(self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }

    /// Inverse of [`level`](Self::level).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            3 => Some(Self::V31),
            4 => Some(Self::V311),
            _ => None,
        }
    }
}

/// SUBACK return code signalling a rejected subscription.
pub const SUBACK_FAILURE: u8 = 0x80;

/// Largest valid message identifier.
pub const MAX_MESSAGE_ID: u16 = u16::MAX;

/// Smallest valid message identifier; 0 means "not assigned".
pub const MIN_MESSAGE_ID: u16 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_nibble() {
        assert_eq!(PacketType::from_byte(0x30).unwrap(), PacketType::Publish);
        assert_eq!(PacketType::from_byte(0x62).unwrap(), PacketType::Pubrel);
        assert_eq!(PacketType::from_byte(0xE0).unwrap(), PacketType::Disconnect);
        assert_eq!(PacketType::from_byte(0x00), Err(Error::UnknownPacketType(0)));
        assert_eq!(PacketType::from_byte(0xF0), Err(Error::UnknownPacketType(15)));
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
    }

    #[test]
    fn test_protocol_levels() {
        assert_eq!(ProtocolVersion::V31.level(), 3);
        assert_eq!(ProtocolVersion::V311.name(), "MQTT");
        assert_eq!(ProtocolVersion::from_level(4), Some(ProtocolVersion::V311));
        assert_eq!(ProtocolVersion::from_level(5), None);
    }
}
