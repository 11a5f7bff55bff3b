//! Packet model and per-kind encode / decode.

use std::borrow::Cow;
use std::fmt;

use super::{ConnackCode, PacketType, ProtocolVersion, QoS, mbi, utf8};
use crate::network::application::mqtt::error::Error;

/// Will message registered with the broker in CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Topic the will is published to.
    pub topic: String,
    /// Will message body.
    pub payload: Vec<u8>,
    /// QoS the broker publishes the will with.
    pub qos: QoS,
    /// Whether the broker retains the will.
    pub retain: bool,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol name and level to announce.
    pub version: ProtocolVersion,
    /// Client identifier; may be empty with a clean session.
    pub client_id: String,
    /// Ask the broker to discard any previous session.
    pub clean_session: bool,
    /// Keep-alive interval in seconds; 0 disables keep-alive.
    pub keep_alive: u16,
    /// Message the broker publishes if the connection drops.
    pub will: Option<LastWill>,
    /// User name for authentication.
    pub username: Option<String>,
    /// Password; only sent together with a user name.
    pub password: Option<Vec<u8>>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    /// The broker resumed a stored session.
    pub session_present: bool,
    /// Outcome of the connection request.
    pub code: ConnackCode,
}

/// PUBLISH packet.
///
/// `message_id` is 0 until the session assigns one; QoS 0 publishes never
/// carry an identifier on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Topic name, never containing wildcards.
    pub topic: String,
    /// Identifier for QoS 1 and 2; 0 for QoS 0.
    pub message_id: u16,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Ask the broker to retain the message.
    pub retain: bool,
    /// The message may have been sent before.
    pub dup: bool,
    /// Application payload.
    pub payload: Vec<u8>,
}

impl Publish {
    /// A publish with no identifier and no flags other than QoS.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            message_id: 0,
            qos,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    /// Identifier echoed in the SUBACK.
    pub message_id: u16,
    /// Topic filters with their requested QoS.
    pub filters: Vec<(String, QoS)>,
}

/// SUBACK packet. A return code of [`SUBACK_FAILURE`](super::SUBACK_FAILURE)
/// marks a rejected filter; anything else is the granted QoS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    /// Identifier of the SUBSCRIBE being answered.
    pub message_id: u16,
    /// One code per requested filter, in order.
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Identifier echoed in the UNSUBACK.
    pub message_id: u16,
    /// Topic filters to remove.
    pub filters: Vec<String>,
}

/// One MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// CONNECT.
    Connect(Connect),
    /// CONNACK.
    Connack(Connack),
    /// PUBLISH.
    Publish(Publish),
    /// PUBACK.
    Puback {
        /// Identifier of the acknowledged QoS 1 message.
        message_id: u16,
    },
    /// PUBREC.
    Pubrec {
        /// Identifier of the received QoS 2 message.
        message_id: u16,
    },
    /// PUBREL.
    Pubrel {
        /// Identifier of the released QoS 2 message.
        message_id: u16,
    },
    /// PUBCOMP.
    Pubcomp {
        /// Identifier of the completed QoS 2 message.
        message_id: u16,
    },
    /// SUBSCRIBE.
    Subscribe(Subscribe),
    /// SUBACK.
    Suback(Suback),
    /// UNSUBSCRIBE.
    Unsubscribe(Unsubscribe),
    /// UNSUBACK.
    Unsuback {
        /// Identifier of the UNSUBSCRIBE being answered.
        message_id: u16,
    },
    /// PINGREQ.
    Pingreq,
    /// PINGRESP.
    Pingresp,
    /// DISCONNECT.
    Disconnect,
}

impl Packet {
    /// Kind of this packet.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback { .. } => PacketType::Puback,
            Packet::Pubrec { .. } => PacketType::Pubrec,
            Packet::Pubrel { .. } => PacketType::Pubrel,
            Packet::Pubcomp { .. } => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback { .. } => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// The packet's message identifier, or 0 if it has none.
    pub fn message_id(&self) -> u16 {
        match self {
            Packet::Publish(p) => p.message_id,
            Packet::Subscribe(s) => s.message_id,
            Packet::Suback(s) => s.message_id,
            Packet::Unsubscribe(u) => u.message_id,
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubrel { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => *message_id,
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Pingreq
            | Packet::Pingresp
            | Packet::Disconnect => 0,
        }
    }

    /// Assign the message identifier. Ignored by packets that carry none.
    pub fn set_message_id(&mut self, id: u16) {
        match self {
            Packet::Publish(p) => p.message_id = id,
            Packet::Subscribe(s) => s.message_id = id,
            Packet::Suback(s) => s.message_id = id,
            Packet::Unsubscribe(u) => u.message_id = id,
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubrel { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => *message_id = id,
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Pingreq
            | Packet::Pingresp
            | Packet::Disconnect => {}
        }
    }

    /// Whether the packet carries a message identifier on the wire. PUBLISH
    /// only does above QoS 0.
    pub fn requires_message_id(&self) -> bool {
        match self {
            Packet::Publish(p) => p.qos != QoS::AtMostOnce,
            Packet::Connect(_)
            | Packet::Connack(_)
            | Packet::Pingreq
            | Packet::Pingresp
            | Packet::Disconnect => false,
            _ => true,
        }
    }

    /// Whether the packet answers an earlier request and so resolves a
    /// token. PUBREL is a request in its own right, not an ack.
    pub fn is_ack(&self) -> bool {
        matches!(
            self,
            Packet::Connack(_)
                | Packet::Puback { .. }
                | Packet::Pubrec { .. }
                | Packet::Pubcomp { .. }
                | Packet::Suback(_)
                | Packet::Unsuback { .. }
                | Packet::Pingresp
        )
    }

    fn flags(&self) -> u8 {
        match self {
            Packet::Publish(p) => ((p.dup as u8) << 3) | ((p.qos as u8) << 1) | p.retain as u8,
            Packet::Pubrel { .. } | Packet::Subscribe(_) | Packet::Unsubscribe(_) => 0x02,
            _ => 0x00,
        }
    }

    /// Encode the packet as a header (fixed header plus variable header)
    /// and a payload. PUBLISH payloads are borrowed rather than copied.
    pub fn encode_parts(&self) -> Result<(Vec<u8>, Cow<'_, [u8]>), Error> {
        let mut variable = Vec::new();
        let payload: Cow<'_, [u8]> = match self {
            Packet::Connect(c) => Cow::Owned(encode_connect(c, &mut variable)?),
            Packet::Connack(c) => {
                variable.push(c.session_present as u8);
                variable.push(c.code as u8);
                Cow::Borrowed(&[])
            }
            Packet::Publish(p) => {
                utf8::encode_string(&mut variable, &p.topic)?;
                if p.qos != QoS::AtMostOnce {
                    variable.extend_from_slice(&p.message_id.to_be_bytes());
                }
                Cow::Borrowed(p.payload.as_slice())
            }
            Packet::Puback { message_id }
            | Packet::Pubrec { message_id }
            | Packet::Pubrel { message_id }
            | Packet::Pubcomp { message_id }
            | Packet::Unsuback { message_id } => {
                variable.extend_from_slice(&message_id.to_be_bytes());
                Cow::Borrowed(&[])
            }
            Packet::Subscribe(s) => {
                if s.filters.is_empty() {
                    return Err(Error::InvalidArgument("SUBSCRIBE needs at least one filter".into()));
                }
                variable.extend_from_slice(&s.message_id.to_be_bytes());
                let mut payload = Vec::new();
                for (filter, qos) in &s.filters {
                    utf8::encode_string(&mut payload, filter)?;
                    payload.push(*qos as u8);
                }
                Cow::Owned(payload)
            }
            Packet::Suback(s) => {
                variable.extend_from_slice(&s.message_id.to_be_bytes());
                Cow::Borrowed(s.return_codes.as_slice())
            }
            Packet::Unsubscribe(u) => {
                if u.filters.is_empty() {
                    return Err(Error::InvalidArgument(
                        "UNSUBSCRIBE needs at least one filter".into(),
                    ));
                }
                variable.extend_from_slice(&u.message_id.to_be_bytes());
                let mut payload = Vec::new();
                for filter in &u.filters {
                    utf8::encode_string(&mut payload, filter)?;
                }
                Cow::Owned(payload)
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => Cow::Borrowed(&[]),
        };

        let remaining = mbi::encode(variable.len() + payload.len())?;
        let mut header = Vec::with_capacity(1 + remaining.len() + variable.len());
        header.push(((self.packet_type() as u8) << 4) | self.flags());
        header.extend_from_slice(&remaining);
        header.extend_from_slice(&variable);
        Ok((header, payload))
    }

    /// Encode the packet into one contiguous frame.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let (mut frame, payload) = self.encode_parts()?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode exactly one complete frame.
    pub fn decode(frame: &[u8]) -> Result<Packet, Error> {
        let first = *frame
            .first()
            .ok_or(Error::MalformedPacket("empty frame"))?;
        let (len, digits) =
            mbi::decode(&frame[1..])?.ok_or(Error::MalformedPacket("truncated fixed header"))?;
        let body = &frame[1 + digits..];
        if body.len() < len {
            return Err(Error::MalformedPacket("frame shorter than remaining length"));
        }
        if body.len() > len {
            return Err(Error::MalformedPacket("trailing bytes after packet"));
        }
        Self::decode_body(first, body)
    }

    /// Build a packet from its first header byte and the `remaining length`
    /// bytes that follow the fixed header.
    pub fn decode_body(first_byte: u8, body: &[u8]) -> Result<Packet, Error> {
        let mut cur = Cursor::new(body);
        let packet = match PacketType::from_byte(first_byte)? {
            PacketType::Connect => Packet::Connect(decode_connect(&mut cur)?),
            PacketType::Connack => {
                let flags = cur.u8()?;
                let code = cur.u8()?;
                Packet::Connack(Connack {
                    session_present: flags & 0x01 != 0,
                    code: ConnackCode::from_byte(code)
                        .ok_or(Error::MalformedPacket("unknown CONNACK return code"))?,
                })
            }
            PacketType::Publish => {
                let qos = QoS::try_from((first_byte >> 1) & 0x03)
                    .map_err(|_| Error::MalformedPacket("PUBLISH with QoS 3"))?;
                let topic = cur.string()?;
                let message_id = if qos == QoS::AtMostOnce { 0 } else { cur.u16()? };
                Packet::Publish(Publish {
                    topic,
                    message_id,
                    qos,
                    retain: first_byte & 0x01 != 0,
                    dup: first_byte & 0x08 != 0,
                    payload: cur.rest().to_vec(),
                })
            }
            PacketType::Puback => Packet::Puback { message_id: cur.u16()? },
            PacketType::Pubrec => Packet::Pubrec { message_id: cur.u16()? },
            PacketType::Pubrel => Packet::Pubrel { message_id: cur.u16()? },
            PacketType::Pubcomp => Packet::Pubcomp { message_id: cur.u16()? },
            PacketType::Unsuback => Packet::Unsuback { message_id: cur.u16()? },
            PacketType::Subscribe => {
                let message_id = cur.u16()?;
                let mut filters = Vec::new();
                while !cur.is_empty() {
                    let filter = cur.string()?;
                    let qos = QoS::try_from(cur.u8()?)
                        .map_err(|_| Error::MalformedPacket("invalid requested QoS"))?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(Error::MalformedPacket("SUBSCRIBE without filters"));
                }
                Packet::Subscribe(Subscribe { message_id, filters })
            }
            PacketType::Suback => Packet::Suback(Suback {
                message_id: cur.u16()?,
                return_codes: cur.rest().to_vec(),
            }),
            PacketType::Unsubscribe => {
                let message_id = cur.u16()?;
                let mut filters = Vec::new();
                while !cur.is_empty() {
                    filters.push(cur.string()?);
                }
                if filters.is_empty() {
                    return Err(Error::MalformedPacket("UNSUBSCRIBE without filters"));
                }
                Packet::Unsubscribe(Unsubscribe { message_id, filters })
            }
            PacketType::Pingreq => Packet::Pingreq,
            PacketType::Pingresp => Packet::Pingresp,
            PacketType::Disconnect => Packet::Disconnect,
        };
        if !cur.is_empty() {
            return Err(Error::MalformedPacket("unexpected bytes at end of packet"));
        }
        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Connect(c) => write!(
                f,
                "CONNECT client_id={} clean={} keep_alive={}",
                c.client_id, c.clean_session, c.keep_alive
            ),
            Packet::Connack(c) => {
                write!(f, "CONNACK code={:?} session_present={}", c.code, c.session_present)
            }
            Packet::Publish(p) => write!(
                f,
                "PUBLISH id={} qos={} dup={} retain={} topic={} len={}",
                p.message_id,
                p.qos,
                p.dup,
                p.retain,
                p.topic,
                p.payload.len()
            ),
            Packet::Subscribe(s) => write!(f, "SUBSCRIBE id={} filters={}", s.message_id, s.filters.len()),
            Packet::Suback(s) => write!(f, "SUBACK id={} codes={:?}", s.message_id, s.return_codes),
            Packet::Unsubscribe(u) => {
                write!(f, "UNSUBSCRIBE id={} filters={}", u.message_id, u.filters.len())
            }
            Packet::Pingreq => f.write_str("PINGREQ"),
            Packet::Pingresp => f.write_str("PINGRESP"),
            Packet::Disconnect => f.write_str("DISCONNECT"),
            other => write!(f, "{:?} id={}", other.packet_type(), other.message_id()),
        }
    }
}

fn encode_connect(c: &Connect, variable: &mut Vec<u8>) -> Result<Vec<u8>, Error> {
    utf8::encode_string(variable, c.version.name())?;
    variable.push(c.version.level());

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if c.password.is_some() {
        flags |= 0x40;
    }
    if c.username.is_some() {
        flags |= 0x80;
    }
    variable.push(flags);
    variable.extend_from_slice(&c.keep_alive.to_be_bytes());

    let mut payload = Vec::new();
    utf8::encode_string(&mut payload, &c.client_id)?;
    if let Some(will) = &c.will {
        utf8::encode_string(&mut payload, &will.topic)?;
        utf8::encode_binary(&mut payload, &will.payload)?;
    }
    if let Some(username) = &c.username {
        utf8::encode_string(&mut payload, username)?;
    }
    if let Some(password) = &c.password {
        utf8::encode_binary(&mut payload, password)?;
    }
    Ok(payload)
}

fn decode_connect(cur: &mut Cursor<'_>) -> Result<Connect, Error> {
    let name = cur.string()?;
    let version = ProtocolVersion::from_level(cur.u8()?)
        .filter(|v| v.name() == name)
        .ok_or(Error::MalformedPacket("unsupported protocol name or level"))?;
    let flags = cur.u8()?;
    if flags & 0x01 != 0 {
        return Err(Error::MalformedPacket("reserved CONNECT flag set"));
    }
    let keep_alive = cur.u16()?;
    let client_id = cur.string()?;
    let will = if flags & 0x04 != 0 {
        Some(LastWill {
            topic: cur.string()?,
            payload: cur.binary()?.to_vec(),
            qos: QoS::try_from((flags >> 3) & 0x03)
                .map_err(|_| Error::MalformedPacket("will QoS 3"))?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 { Some(cur.string()?) } else { None };
    let password = if flags & 0x40 != 0 { Some(cur.binary()?.to_vec()) } else { None };
    Ok(Connect {
        version,
        client_id,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        will,
        username,
        password,
    })
}

/// Bounds-checked reader over a packet body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn u8(&mut self) -> Result<u8, Error> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(Error::MalformedPacket("unexpected end of packet"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn string(&mut self) -> Result<String, Error> {
        let (s, used) = utf8::decode_string(&self.data[self.pos..])?;
        self.pos += used;
        Ok(s)
    }

    fn binary(&mut self) -> Result<&'a [u8], Error> {
        let (bytes, used) = utf8::decode_binary(&self.data[self.pos..])?;
        self.pos += used;
        Ok(bytes)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
