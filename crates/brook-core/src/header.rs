//! Fixed header framing.
//!
//! Two states, strictly in order: the type/flags byte, then the remaining
//! length as a variable byte integer. Each may arrive split over any number
//! of reads.

use crate::codec::{Decode, DecodeResult, Progress};
use crate::error::ProtocolError;
use crate::packet::PacketType;
use crate::varint::{self, VarIntDecoder};

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    /// Low nibble of the first byte.
    pub flags: u8,
    pub remaining_length: u32,
}

impl FixedHeader {
    /// Bytes the header itself occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + varint::encoded_len(self.remaining_length)
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(((self.packet_type as u8) << 4) | (self.flags & 0x0F));
        varint::encode_to_vec(self.remaining_length, buf);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TypeFlags,
    RemainingLength { packet_type: PacketType, flags: u8 },
}

/// Resumable fixed header decoder.
#[derive(Debug)]
pub struct FixedHeaderDecoder {
    state: State,
    length: VarIntDecoder,
}

impl Default for FixedHeaderDecoder {
    fn default() -> Self {
        Self {
            state: State::TypeFlags,
            length: VarIntDecoder::default(),
        }
    }
}

impl FixedHeaderDecoder {
    /// True if no byte of the current header has been consumed yet.
    pub fn is_idle(&self) -> bool {
        self.state == State::TypeFlags
    }
}

impl Decode for FixedHeaderDecoder {
    type Output = FixedHeader;

    /// Unknown packet types and over-long remaining lengths are errors; the
    /// stream cannot be resynchronized after either.
    fn decode(&mut self, buf: &[u8]) -> DecodeResult<FixedHeader> {
        let mut pos = 0;

        if self.state == State::TypeFlags {
            let Some(&byte) = buf.first() else {
                return Ok(Progress::partial(0));
            };
            pos = 1;
            let packet_type = PacketType::try_from(byte >> 4)?;
            self.state = State::RemainingLength {
                packet_type,
                flags: byte & 0x0F,
            };
        }

        let State::RemainingLength { packet_type, flags } = self.state else {
            return Err(ProtocolError::MalformedPacket(
                "fixed header decoder out of sequence".into(),
            ));
        };
        let progress = self.length.decode(&buf[pos..])?;
        pos += progress.consumed;
        match progress.value {
            Some(remaining_length) => {
                self.state = State::TypeFlags;
                Ok(Progress::complete(
                    pos,
                    FixedHeader {
                        packet_type,
                        flags,
                        remaining_length,
                    },
                ))
            }
            None => Ok(Progress::partial(pos)),
        }
    }
}
