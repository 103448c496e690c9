//! Error types for brook.

use std::io;

use thiserror::Error;

use crate::packet::PacketType;

/// Main error type for brook.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
///
/// The first group are framing errors raised by the decoders. The second group
/// are protocol violations detected by a protocol handler after decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Invalid fixed header flags for {packet_type:?}: {flags:#04x}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid protocol name: expected 'MQTT', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Missing packet identifier in {0:?}")]
    MissingPacketId(PacketType),

    #[error("Invalid topic name: '{0}'")]
    InvalidTopicName(String),

    #[error("Unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("Client identifier rejected: '{0}'")]
    IdentifierRejected(String),
}

impl ProtocolError {
    /// True for errors that break the byte stream itself. After one of these the
    /// connection cannot be resynchronized and no acknowledgement is possible.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPacketType(_)
                | ProtocolError::InvalidRemainingLength
                | ProtocolError::PacketTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
