//! brook-core - MQTT 3.1.1 protocol engine.
//!
//! Wire codecs with resumable decoding, topic matching, and the protocol
//! state shared by the server and client crates.

pub mod codec;
pub mod decoder;
pub mod error;
pub mod header;
pub mod inflight;
pub mod keepalive;
pub mod message;
pub mod packet;
pub mod packet_id;
pub mod topic;
pub mod varint;

pub use decoder::{decode_packet, PacketDecoder};
pub use error::{Error, ProtocolError, Result};
pub use inflight::{Inbound, InflightState};
pub use message::Message;
pub use packet::*;
