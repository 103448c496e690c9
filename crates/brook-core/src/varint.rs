//! Variable Byte Integer encoding/decoding for MQTT.
//!
//! MQTT encodes the fixed header's remaining length with 7 bits per byte,
//! least significant group first, and the high bit marking that more bytes
//! follow. Four bytes at most, which gives:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::codec::{Decode, DecodeResult, Progress};
use crate::error::ProtocolError;

/// Largest value a four-byte variable byte integer can carry.
pub const MAX_VALUE: u32 = 268_435_455;

/// Maximum number of bytes in an encoding.
pub const MAX_BYTES: usize = 4;

/// Resumable variable byte integer decoder.
///
/// # Example
/// ```
/// use brook_core::codec::Decode;
/// use brook_core::varint::VarIntDecoder;
///
/// let mut dec = VarIntDecoder::default();
/// assert!(!dec.decode(&[0x80]).unwrap().is_complete());
/// let progress = dec.decode(&[0x01]).unwrap();
/// assert_eq!(progress.value, Some(128));
/// ```
#[derive(Debug, Default)]
pub struct VarIntDecoder {
    value: u32,
    count: usize,
}

impl Decode for VarIntDecoder {
    type Output = u32;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<u32> {
        for (i, &byte) in buf.iter().enumerate() {
            self.value |= ((byte & 0x7F) as u32) << (7 * self.count);
            self.count += 1;

            if byte & 0x80 == 0 {
                let value = self.value;
                *self = Self::default();
                return Ok(Progress::complete(i + 1, value));
            }
            if self.count == MAX_BYTES {
                // A fifth byte would follow
                return Err(ProtocolError::InvalidRemainingLength);
            }
        }
        Ok(Progress::partial(buf.len()))
    }
}

/// Decode a variable byte integer from the start of a buffer.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if more data is needed, or `Err` if the encoding is invalid.
///
/// # Example
/// ```
/// use brook_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let progress = VarIntDecoder::default().decode(buf)?;
    Ok(progress.value.map(|value| (value, progress.consumed)))
}

/// Encode a value as a variable byte integer, appending to a Vec.
///
/// Returns the number of bytes written.
///
/// # Example
/// ```
/// use brook_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// let written = encode_to_vec(300, &mut buf);
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]); // 300 = 44 + 2*128 = 0x2C + 0x80, then 0x02
/// ```
pub fn encode_to_vec(mut value: u32, buf: &mut Vec<u8>) -> usize {
    debug_assert!(value <= MAX_VALUE);
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Calculate the number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use brook_core::varint::encoded_len;
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16383), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}
