//! Client events and state types.

use bytes::Bytes;
use brook_core::QoS;

/// Events returned by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// CONNACK accepted.
    Connected {
        /// Whether the broker kept a previous session.
        session_present: bool,
    },
    /// Connection ended.
    Disconnected {
        /// Reason for disconnection, if known.
        reason: Option<String>,
    },
    /// Received a publish message.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        /// Set on retained messages replayed after a subscribe.
        retain: bool,
    },
    /// Subscribe acknowledgment.
    SubAck {
        /// Packet ID of the SUBSCRIBE.
        packet_id: u16,
        /// Return codes for each topic (0x00-0x02 = granted QoS, 0x80 = failure).
        return_codes: Vec<u8>,
    },
    /// Unsubscribe acknowledgment.
    UnsubAck { packet_id: u16 },
    /// QoS 1 publish acknowledged.
    PubAck { packet_id: u16 },
    /// QoS 2 publish complete.
    PubComp { packet_id: u16 },
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// CONNECT sent, waiting for CONNACK.
    Connecting,
    Connected,
}
