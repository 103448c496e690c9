//! MQTT 3.1.1 control packets and their encoders.
//!
//! Decoding lives in [`crate::decoder`], which rebuilds these types
//! incrementally from partial reads.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::{prefixed_len, put_binary, put_str, put_u16};
use crate::error::ProtocolError;
use crate::varint;

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// SUBACK return code for a rejected topic filter.
pub const SUBACK_FAILURE: u8 = 0x80;

/// MQTT Control Packet Types (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

impl PacketType {
    /// Fixed header flags required for every type except PUBLISH.
    /// MQTT-3.6.1-1, MQTT-3.8.1-1, MQTT-3.10.1-1: PUBREL, SUBSCRIBE and
    /// UNSUBSCRIBE carry 0b0010; everything else is reserved as zero.
    #[inline]
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Quality of Service levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
#[allow(clippy::enum_variant_names)] // MQTT spec names
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(ProtocolError::InvalidQoS(value)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

/// CONNACK return codes (MQTT 3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnackCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUsernamePassword = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnackCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnackCode::Accepted),
            1 => Ok(ConnackCode::UnacceptableProtocolVersion),
            2 => Ok(ConnackCode::IdentifierRejected),
            3 => Ok(ConnackCode::ServerUnavailable),
            4 => Ok(ConnackCode::BadUsernamePassword),
            5 => Ok(ConnackCode::NotAuthorized),
            _ => Err(ProtocolError::MalformedPacket(format!(
                "Invalid CONNACK return code: {}",
                value
            ))),
        }
    }
}

/// MQTT Packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback { packet_id: u16 },
    Pubrec { packet_id: u16 },
    Pubrel { packet_id: u16 },
    Pubcomp { packet_id: u16 },
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback { packet_id: u16 },
    Pingreq,
    Pingresp,
    Disconnect,
}

/// CONNECT packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            clean_session: true,
            keep_alive: 0,
            client_id: String::new(),
            will: None,
            username: None,
            password: None,
        }
    }
}

/// Will message configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// CONNACK packet data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnackCode,
}

/// PUBLISH packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos > 0`.
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    fn flags(&self) -> u8 {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }
        flags
    }
}

/// A topic filter with its requested QoS, as carried in SUBSCRIBE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub name: String,
    pub qos: QoS,
}

impl Topic {
    pub fn new(name: impl Into<String>, qos: QoS) -> Self {
        Self {
            name: name.into(),
            qos,
        }
    }
}

/// SUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub topics: Vec<Topic>,
}

/// SUBACK packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    /// 0x00-0x02 = granted QoS, 0x80 = failure.
    pub return_codes: Vec<u8>,
}

/// UNSUBSCRIBE packet data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub topics: Vec<String>,
}

impl Packet {
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

    /// Append the complete wire encoding of this packet to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Packet::Connect(connect) => encode_connect(connect, buf),
            Packet::Connack(connack) => encode_connack(connack, buf),
            Packet::Publish(publish) => encode_publish(publish, buf),
            Packet::Puback { packet_id } => encode_ack(PacketType::Puback, *packet_id, buf),
            Packet::Pubrec { packet_id } => encode_ack(PacketType::Pubrec, *packet_id, buf),
            Packet::Pubrel { packet_id } => encode_ack(PacketType::Pubrel, *packet_id, buf),
            Packet::Pubcomp { packet_id } => encode_ack(PacketType::Pubcomp, *packet_id, buf),
            Packet::Subscribe(subscribe) => encode_subscribe(subscribe, buf),
            Packet::Suback(suback) => encode_suback(suback, buf),
            Packet::Unsubscribe(unsubscribe) => encode_unsubscribe(unsubscribe, buf),
            Packet::Unsuback { packet_id } => encode_ack(PacketType::Unsuback, *packet_id, buf),
            Packet::Pingreq => encode_empty(PacketType::Pingreq, buf),
            Packet::Pingresp => encode_empty(PacketType::Pingresp, buf),
            Packet::Disconnect => encode_empty(PacketType::Disconnect, buf),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

// === Encoding ===

/// Write the fixed header: type/flags byte, then the remaining length.
#[inline]
fn encode_fixed_header(packet_type: PacketType, flags: u8, remaining: usize, buf: &mut Vec<u8>) {
    buf.push(((packet_type as u8) << 4) | (flags & 0x0F));
    varint::encode_to_vec(remaining as u32, buf);
}

fn encode_flags(packet_type: PacketType) -> u8 {
    packet_type.required_flags().unwrap_or(0)
}

/// Encode a CONNECT packet.
pub fn encode_connect(connect: &Connect, buf: &mut Vec<u8>) {
    let mut flags = 0u8;
    let mut remaining = prefixed_len(connect.protocol_name.as_bytes()) + 1 + 1 + 2;
    remaining += prefixed_len(connect.client_id.as_bytes());

    if connect.clean_session {
        flags |= 0x02;
    }
    if let Some(ref will) = connect.will {
        flags |= 0x04;
        flags |= (will.qos as u8) << 3;
        if will.retain {
            flags |= 0x20;
        }
        remaining += prefixed_len(will.topic.as_bytes()) + prefixed_len(&will.message);
    }
    if let Some(ref password) = connect.password {
        flags |= 0x40;
        remaining += prefixed_len(password);
    }
    if let Some(ref username) = connect.username {
        flags |= 0x80;
        remaining += prefixed_len(username.as_bytes());
    }

    buf.reserve(remaining + 5);
    encode_fixed_header(PacketType::Connect, 0, remaining, buf);
    put_str(&connect.protocol_name, buf);
    buf.push(connect.protocol_level);
    buf.push(flags);
    put_u16(connect.keep_alive, buf);
    put_str(&connect.client_id, buf);
    if let Some(ref will) = connect.will {
        put_str(&will.topic, buf);
        put_binary(&will.message, buf);
    }
    if let Some(ref username) = connect.username {
        put_str(username, buf);
    }
    if let Some(ref password) = connect.password {
        put_binary(password, buf);
    }
}

/// Encode a CONNACK packet.
pub fn encode_connack(connack: &Connack, buf: &mut Vec<u8>) {
    encode_fixed_header(PacketType::Connack, 0, 2, buf);
    buf.push(connack.session_present as u8);
    buf.push(connack.code as u8);
}

/// Encode a PUBLISH packet.
pub fn encode_publish(publish: &Publish, buf: &mut Vec<u8>) {
    let id_len = if publish.qos != QoS::AtMostOnce { 2 } else { 0 };
    let remaining = prefixed_len(publish.topic.as_bytes()) + id_len + publish.payload.len();

    buf.reserve(remaining + 5);
    encode_fixed_header(PacketType::Publish, publish.flags(), remaining, buf);
    put_str(&publish.topic, buf);
    if id_len > 0 {
        put_u16(publish.packet_id.unwrap_or(0), buf);
    }
    buf.extend_from_slice(&publish.payload);
}

/// Encode PUBACK, PUBREC, PUBREL, PUBCOMP or UNSUBACK: a packet identifier only.
pub fn encode_ack(packet_type: PacketType, packet_id: u16, buf: &mut Vec<u8>) {
    encode_fixed_header(packet_type, encode_flags(packet_type), 2, buf);
    put_u16(packet_id, buf);
}

/// Encode a SUBSCRIBE packet.
pub fn encode_subscribe(subscribe: &Subscribe, buf: &mut Vec<u8>) {
    let remaining = 2 + subscribe
        .topics
        .iter()
        .map(|topic| prefixed_len(topic.name.as_bytes()) + 1)
        .sum::<usize>();

    encode_fixed_header(PacketType::Subscribe, 0x02, remaining, buf);
    put_u16(subscribe.packet_id, buf);
    for topic in &subscribe.topics {
        put_str(&topic.name, buf);
        buf.push(topic.qos as u8);
    }
}

/// Encode a SUBACK packet.
pub fn encode_suback(suback: &Suback, buf: &mut Vec<u8>) {
    encode_fixed_header(PacketType::Suback, 0, 2 + suback.return_codes.len(), buf);
    put_u16(suback.packet_id, buf);
    buf.extend_from_slice(&suback.return_codes);
}

/// Encode an UNSUBSCRIBE packet.
pub fn encode_unsubscribe(unsubscribe: &Unsubscribe, buf: &mut Vec<u8>) {
    let remaining = 2 + unsubscribe
        .topics
        .iter()
        .map(|topic| prefixed_len(topic.as_bytes()))
        .sum::<usize>();

    encode_fixed_header(PacketType::Unsubscribe, 0x02, remaining, buf);
    put_u16(unsubscribe.packet_id, buf);
    for topic in &unsubscribe.topics {
        put_str(topic, buf);
    }
}

/// Encode PINGREQ, PINGRESP or DISCONNECT.
pub fn encode_empty(packet_type: PacketType, buf: &mut Vec<u8>) {
    buf.push((packet_type as u8) << 4);
    buf.push(0);
}
