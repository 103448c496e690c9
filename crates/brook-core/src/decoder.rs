//! Resumable packet decoding.
//!
//! [`PacketDecoder`] frames the byte stream with a [`FixedHeaderDecoder`] and
//! hands exactly `remaining_length` bytes to a per-type body decoder. Body
//! decoders walk their fields with an internal cursor, so a read that ends in
//! the middle of any field simply resumes on the next call.
//!
//! Only structural problems are reported here (bad flags, lengths that do not
//! add up, invalid UTF-8). Semantic checks such as the protocol name or a zero
//! packet identifier belong to the protocol handler.

use std::mem;

use bytes::Bytes;

use crate::codec::{
    decode_field, BinaryDecoder, Decode, DecodeResult, Progress, RawDecoder, StringDecoder,
    U16Decoder, U8Decoder,
};
use crate::error::ProtocolError;
use crate::header::{FixedHeader, FixedHeaderDecoder};
use crate::packet::{
    Connack, ConnackCode, Connect, Packet, PacketType, Publish, QoS, Suback, Subscribe, Topic,
    Unsubscribe, Will, SUBACK_FAILURE,
};

/// Streaming decoder for a sequence of packets.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    header: FixedHeaderDecoder,
    body: Option<BodyDecoder>,
    /// Largest accepted packet including its fixed header (0 = no limit).
    max_packet_size: usize,
}

impl PacketDecoder {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            ..Default::default()
        }
    }

    /// True between packets.
    pub fn is_idle(&self) -> bool {
        self.body.is_none() && self.header.is_idle()
    }

    /// Header of the packet currently being decoded, if framing is done.
    pub fn current_header(&self) -> Option<FixedHeader> {
        self.body.as_ref().map(|body| body.header)
    }
}

impl Decode for PacketDecoder {
    type Output = Packet;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Packet> {
        let mut pos = 0;

        if self.body.is_none() {
            let header = decode_field!(self.header, buf, pos);
            let size = header.encoded_len() + header.remaining_length as usize;
            if self.max_packet_size > 0 && size > self.max_packet_size {
                return Err(ProtocolError::PacketTooLarge {
                    size,
                    max: self.max_packet_size,
                });
            }
            self.body = Some(BodyDecoder::new(header)?);
        }

        let Some(body) = self.body.as_mut() else {
            return Ok(Progress::partial(pos));
        };
        let progress = body.decode(&buf[pos..])?;
        pos += progress.consumed;
        match progress.value {
            Some(packet) => {
                self.body = None;
                Ok(Progress::complete(pos, packet))
            }
            None => Ok(Progress::partial(pos)),
        }
    }
}

/// Decode one complete packet from the start of `buf`.
///
/// Returns `Ok(Some((packet, bytes_consumed)))` if a whole packet is present,
/// `Ok(None)` if more data is needed.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(Packet, usize)>, ProtocolError> {
    let progress = PacketDecoder::default().decode(buf)?;
    Ok(progress.value.map(|packet| (packet, progress.consumed)))
}

/// Decoder for the variable header and payload of one packet.
#[derive(Debug)]
pub struct BodyDecoder {
    header: FixedHeader,
    /// Body bytes not yet consumed.
    left: usize,
    kind: Body,
}

#[derive(Debug)]
enum Body {
    Connect(ConnectDecoder),
    Connack(ConnackDecoder),
    Publish(PublishDecoder),
    Ack(AckDecoder),
    Subscribe(SubscribeDecoder),
    Suback(SubackDecoder),
    Unsubscribe(UnsubscribeDecoder),
    Empty(PacketType),
}

impl BodyDecoder {
    /// Validate the fixed header and pick the decoder for its packet type.
    pub fn new(header: FixedHeader) -> Result<Self, ProtocolError> {
        let packet_type = header.packet_type;
        if let Some(required) = packet_type.required_flags() {
            if header.flags != required {
                return Err(ProtocolError::InvalidFlags {
                    packet_type,
                    flags: header.flags,
                });
            }
        }

        let fixed_len = match packet_type {
            PacketType::Connack
            | PacketType::Puback
            | PacketType::Pubrec
            | PacketType::Pubrel
            | PacketType::Pubcomp
            | PacketType::Unsuback => Some(2),
            PacketType::Pingreq | PacketType::Pingresp | PacketType::Disconnect => Some(0),
            _ => None,
        };
        if let Some(len) = fixed_len {
            if header.remaining_length != len {
                return Err(ProtocolError::MalformedPacket(format!(
                    "{:?} remaining length must be {}, got {}",
                    packet_type, len, header.remaining_length
                )));
            }
        }

        let kind = match packet_type {
            PacketType::Connect => Body::Connect(ConnectDecoder::default()),
            PacketType::Connack => Body::Connack(ConnackDecoder::default()),
            PacketType::Publish => Body::Publish(PublishDecoder::new(header.flags)?),
            PacketType::Puback
            | PacketType::Pubrec
            | PacketType::Pubrel
            | PacketType::Pubcomp
            | PacketType::Unsuback => Body::Ack(AckDecoder::new(packet_type)),
            PacketType::Subscribe => Body::Subscribe(SubscribeDecoder::default()),
            PacketType::Suback => Body::Suback(SubackDecoder::default()),
            PacketType::Unsubscribe => Body::Unsubscribe(UnsubscribeDecoder::default()),
            PacketType::Pingreq | PacketType::Pingresp | PacketType::Disconnect => {
                Body::Empty(packet_type)
            }
        };

        Ok(Self {
            header,
            left: header.remaining_length as usize,
            kind,
        })
    }
}

impl Decode for BodyDecoder {
    type Output = Packet;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Packet> {
        let buf = &buf[..buf.len().min(self.left)];
        let left = self.left;
        let progress = match &mut self.kind {
            Body::Connect(dec) => dec.decode(buf)?,
            Body::Connack(dec) => dec.decode(buf)?,
            Body::Publish(dec) => dec.decode(buf, left)?,
            Body::Ack(dec) => dec.decode(buf)?,
            Body::Subscribe(dec) => dec.decode(buf, left)?,
            Body::Suback(dec) => dec.decode(buf, left)?,
            Body::Unsubscribe(dec) => dec.decode(buf, left)?,
            Body::Empty(packet_type) => Progress::complete(0, empty_packet(*packet_type)),
        };
        self.left -= progress.consumed;

        match progress.value {
            Some(_) if self.left != 0 => Err(ProtocolError::MalformedPacket(format!(
                "{:?} has {} trailing bytes",
                self.header.packet_type, self.left
            ))),
            Some(packet) => Ok(Progress::complete(progress.consumed, packet)),
            None if self.left == 0 => Err(ProtocolError::MalformedPacket(format!(
                "{:?} fields exceed remaining length {}",
                self.header.packet_type, self.header.remaining_length
            ))),
            None => Ok(Progress::partial(progress.consumed)),
        }
    }
}

fn empty_packet(packet_type: PacketType) -> Packet {
    match packet_type {
        PacketType::Pingreq => Packet::Pingreq,
        PacketType::Pingresp => Packet::Pingresp,
        _ => Packet::Disconnect,
    }
}

// === CONNECT ===

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ConnectField {
    #[default]
    ProtocolName,
    Level,
    Flags,
    KeepAlive,
    ClientId,
    WillTopic,
    WillMessage,
    Username,
    Password,
}

#[derive(Debug, Default)]
struct ConnectDecoder {
    field: ConnectField,
    byte: U8Decoder,
    word: U16Decoder,
    string: StringDecoder,
    binary: BinaryDecoder,
    flags: u8,
    connect: Connect,
    will_topic: String,
}

impl ConnectDecoder {
    fn has_will(&self) -> bool {
        self.flags & 0x04 != 0
    }

    fn has_username(&self) -> bool {
        self.flags & 0x80 != 0
    }

    fn has_password(&self) -> bool {
        self.flags & 0x40 != 0
    }

    fn check_flags(flags: u8) -> Result<(), ProtocolError> {
        // MQTT-3.1.2-3: reserved bit must be zero
        if flags & 0x01 != 0 {
            return Err(ProtocolError::InvalidConnectFlags(flags));
        }
        let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
        // MQTT-3.1.2-13/15: no will means no will QoS or retain
        if flags & 0x04 == 0 && (will_qos != QoS::AtMostOnce || flags & 0x20 != 0) {
            return Err(ProtocolError::InvalidConnectFlags(flags));
        }
        // MQTT-3.1.2-22: password requires username
        if flags & 0x80 == 0 && flags & 0x40 != 0 {
            return Err(ProtocolError::InvalidConnectFlags(flags));
        }
        Ok(())
    }

    /// Field that follows `field`, given the flags already read.
    fn next_after(&self, field: ConnectField) -> Option<ConnectField> {
        let after_will = || {
            if self.has_username() {
                Some(ConnectField::Username)
            } else if self.has_password() {
                Some(ConnectField::Password)
            } else {
                None
            }
        };
        match field {
            ConnectField::ProtocolName => Some(ConnectField::Level),
            ConnectField::Level => Some(ConnectField::Flags),
            ConnectField::Flags => Some(ConnectField::KeepAlive),
            ConnectField::KeepAlive => Some(ConnectField::ClientId),
            ConnectField::ClientId if self.has_will() => Some(ConnectField::WillTopic),
            ConnectField::ClientId => after_will(),
            ConnectField::WillTopic => Some(ConnectField::WillMessage),
            ConnectField::WillMessage => after_will(),
            ConnectField::Username if self.has_password() => Some(ConnectField::Password),
            ConnectField::Username | ConnectField::Password => None,
        }
    }

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Packet> {
        let mut pos = 0;
        loop {
            let field = self.field;
            match field {
                ConnectField::ProtocolName => {
                    self.connect.protocol_name = decode_field!(self.string, buf, pos);
                }
                ConnectField::Level => {
                    self.connect.protocol_level = decode_field!(self.byte, buf, pos);
                }
                ConnectField::Flags => {
                    let flags = decode_field!(self.byte, buf, pos);
                    Self::check_flags(flags)?;
                    self.flags = flags;
                    self.connect.clean_session = flags & 0x02 != 0;
                }
                ConnectField::KeepAlive => {
                    self.connect.keep_alive = decode_field!(self.word, buf, pos);
                }
                ConnectField::ClientId => {
                    self.connect.client_id = decode_field!(self.string, buf, pos);
                }
                ConnectField::WillTopic => {
                    self.will_topic = decode_field!(self.string, buf, pos);
                }
                ConnectField::WillMessage => {
                    let message = decode_field!(self.binary, buf, pos);
                    self.connect.will = Some(Will {
                        topic: mem::take(&mut self.will_topic),
                        message: Bytes::from(message),
                        qos: QoS::try_from((self.flags >> 3) & 0x03)?,
                        retain: self.flags & 0x20 != 0,
                    });
                }
                ConnectField::Username => {
                    self.connect.username = Some(decode_field!(self.string, buf, pos));
                }
                ConnectField::Password => {
                    self.connect.password = Some(decode_field!(self.binary, buf, pos));
                }
            }

            match self.next_after(field) {
                Some(next) => self.field = next,
                None => {
                    self.field = ConnectField::default();
                    let connect = mem::take(&mut self.connect);
                    return Ok(Progress::complete(pos, Packet::Connect(connect)));
                }
            }
        }
    }
}

// === CONNACK ===

#[derive(Debug, Default)]
struct ConnackDecoder {
    byte: U8Decoder,
    ack_flags: Option<u8>,
}

impl ConnackDecoder {
    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Packet> {
        let mut pos = 0;
        if self.ack_flags.is_none() {
            let flags = decode_field!(self.byte, buf, pos);
            // MQTT-3.2.2-1: bits 7-1 are reserved
            if flags & 0xFE != 0 {
                return Err(ProtocolError::MalformedPacket(format!(
                    "Invalid CONNACK flags: {:#04x}",
                    flags
                )));
            }
            self.ack_flags = Some(flags);
        }
        let code = ConnackCode::try_from(decode_field!(self.byte, buf, pos))?;
        let session_present = self.ack_flags.take().unwrap_or(0) & 0x01 != 0;
        Ok(Progress::complete(
            pos,
            Packet::Connack(Connack {
                session_present,
                code,
            }),
        ))
    }
}

// === PUBLISH ===

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum PublishField {
    #[default]
    Topic,
    PacketId,
    Payload,
}

#[derive(Debug)]
struct PublishDecoder {
    field: PublishField,
    dup: bool,
    qos: QoS,
    retain: bool,
    string: StringDecoder,
    word: U16Decoder,
    payload: Option<RawDecoder>,
    topic: String,
    packet_id: Option<u16>,
}

impl PublishDecoder {
    fn new(flags: u8) -> Result<Self, ProtocolError> {
        Ok(Self {
            field: PublishField::Topic,
            dup: flags & 0x08 != 0,
            qos: QoS::try_from((flags >> 1) & 0x03)?,
            retain: flags & 0x01 != 0,
            string: StringDecoder::default(),
            word: U16Decoder::default(),
            payload: None,
            topic: String::new(),
            packet_id: None,
        })
    }

    fn decode(&mut self, buf: &[u8], left: usize) -> DecodeResult<Packet> {
        let mut pos = 0;
        loop {
            match self.field {
                PublishField::Topic => {
                    self.topic = decode_field!(self.string, buf, pos);
                    self.field = if self.qos == QoS::AtMostOnce {
                        PublishField::Payload
                    } else {
                        PublishField::PacketId
                    };
                }
                PublishField::PacketId => {
                    self.packet_id = Some(decode_field!(self.word, buf, pos));
                    self.field = PublishField::Payload;
                }
                PublishField::Payload => {
                    // Everything after the variable header is payload
                    let payload = self
                        .payload
                        .get_or_insert_with(|| RawDecoder::new(left - pos));
                    let payload = decode_field!(*payload, buf, pos);
                    return Ok(Progress::complete(
                        pos,
                        Packet::Publish(Publish {
                            dup: self.dup,
                            qos: self.qos,
                            retain: self.retain,
                            topic: mem::take(&mut self.topic),
                            packet_id: self.packet_id,
                            payload: Bytes::from(payload),
                        }),
                    ));
                }
            }
        }
    }
}

// === PUBACK / PUBREC / PUBREL / PUBCOMP / UNSUBACK ===

#[derive(Debug)]
struct AckDecoder {
    packet_type: PacketType,
    word: U16Decoder,
}

impl AckDecoder {
    fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            word: U16Decoder::default(),
        }
    }

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Packet> {
        let mut pos = 0;
        let packet_id = decode_field!(self.word, buf, pos);
        let packet = match self.packet_type {
            PacketType::Puback => Packet::Puback { packet_id },
            PacketType::Pubrec => Packet::Pubrec { packet_id },
            PacketType::Pubrel => Packet::Pubrel { packet_id },
            PacketType::Pubcomp => Packet::Pubcomp { packet_id },
            _ => Packet::Unsuback { packet_id },
        };
        Ok(Progress::complete(pos, packet))
    }
}

// === SUBSCRIBE ===

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ListField {
    #[default]
    PacketId,
    Entry,
    Qos,
}

#[derive(Debug, Default)]
struct SubscribeDecoder {
    field: ListField,
    word: U16Decoder,
    string: StringDecoder,
    byte: U8Decoder,
    packet_id: u16,
    name: String,
    topics: Vec<Topic>,
}

impl SubscribeDecoder {
    fn decode(&mut self, buf: &[u8], left: usize) -> DecodeResult<Packet> {
        let mut pos = 0;
        loop {
            match self.field {
                ListField::PacketId => {
                    self.packet_id = decode_field!(self.word, buf, pos);
                    self.field = ListField::Entry;
                }
                ListField::Entry if left == pos => {
                    // MQTT-3.8.3-3: at least one topic filter
                    if self.topics.is_empty() {
                        return Err(ProtocolError::MalformedPacket(
                            "SUBSCRIBE with no topics".into(),
                        ));
                    }
                    let subscribe = Subscribe {
                        packet_id: self.packet_id,
                        topics: mem::take(&mut self.topics),
                    };
                    return Ok(Progress::complete(pos, Packet::Subscribe(subscribe)));
                }
                ListField::Entry => {
                    self.name = decode_field!(self.string, buf, pos);
                    self.field = ListField::Qos;
                }
                ListField::Qos => {
                    let options = decode_field!(self.byte, buf, pos);
                    // MQTT-3.8.3-4: upper six bits are reserved
                    if options & 0xFC != 0 {
                        return Err(ProtocolError::MalformedPacket(format!(
                            "Invalid SUBSCRIBE options byte: {:#04x}",
                            options
                        )));
                    }
                    self.topics.push(Topic {
                        name: mem::take(&mut self.name),
                        qos: QoS::try_from(options)?,
                    });
                    self.field = ListField::Entry;
                }
            }
        }
    }
}

// === SUBACK ===

#[derive(Debug, Default)]
struct SubackDecoder {
    word: U16Decoder,
    byte: U8Decoder,
    packet_id: Option<u16>,
    return_codes: Vec<u8>,
}

impl SubackDecoder {
    fn decode(&mut self, buf: &[u8], left: usize) -> DecodeResult<Packet> {
        let mut pos = 0;
        if self.packet_id.is_none() {
            self.packet_id = Some(decode_field!(self.word, buf, pos));
        }
        while pos < left {
            let code = decode_field!(self.byte, buf, pos);
            if code > 2 && code != SUBACK_FAILURE {
                return Err(ProtocolError::MalformedPacket(format!(
                    "Invalid SUBACK return code: {:#04x}",
                    code
                )));
            }
            self.return_codes.push(code);
        }
        let suback = Suback {
            packet_id: self.packet_id.take().unwrap_or(0),
            return_codes: mem::take(&mut self.return_codes),
        };
        Ok(Progress::complete(pos, Packet::Suback(suback)))
    }
}

// === UNSUBSCRIBE ===

#[derive(Debug, Default)]
struct UnsubscribeDecoder {
    word: U16Decoder,
    string: StringDecoder,
    packet_id: Option<u16>,
    topics: Vec<String>,
}

impl UnsubscribeDecoder {
    fn decode(&mut self, buf: &[u8], left: usize) -> DecodeResult<Packet> {
        let mut pos = 0;
        if self.packet_id.is_none() {
            self.packet_id = Some(decode_field!(self.word, buf, pos));
        }
        while pos < left {
            let topic = decode_field!(self.string, buf, pos);
            self.topics.push(topic);
        }
        // MQTT-3.10.3-2: at least one topic filter
        if self.topics.is_empty() {
            return Err(ProtocolError::MalformedPacket(
                "UNSUBSCRIBE with no topics".into(),
            ));
        }
        let unsubscribe = Unsubscribe {
            packet_id: self.packet_id.take().unwrap_or(0),
            topics: mem::take(&mut self.topics),
        };
        Ok(Progress::complete(pos, Packet::Unsubscribe(unsubscribe)))
    }
}
