//! Primitive field codecs.
//!
//! Every decoder here is resumable: it is fed whatever bytes are available,
//! reports how many it consumed, and keeps its partial progress until the
//! field is complete. A completed decoder resets itself so it can be reused
//! for the next field of the same kind.
//!
//! Encoding is the mirror operation and always writes a complete field.

use crate::error::ProtocolError;

/// Outcome of feeding bytes to a resumable decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress<T> {
    /// Bytes taken from the input in this call.
    pub consumed: usize,
    /// The decoded value, once every byte of it has arrived.
    pub value: Option<T>,
}

impl<T> Progress<T> {
    pub fn partial(consumed: usize) -> Self {
        Self {
            consumed,
            value: None,
        }
    }

    pub fn complete(consumed: usize, value: T) -> Self {
        Self {
            consumed,
            value: Some(value),
        }
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.value.is_some()
    }
}

pub type DecodeResult<T> = std::result::Result<Progress<T>, ProtocolError>;

/// A resumable decoder for one field.
pub trait Decode {
    type Output;

    /// Consume bytes from `buf` until the field is complete or `buf` runs out.
    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Self::Output>;
}

/// Feed `$buf[$pos..]` to a field decoder and advance `$pos`. Evaluates to the
/// field value, or returns a partial `Progress` from the enclosing function
/// when the field still needs bytes.
macro_rules! decode_field {
    ($decoder:expr, $buf:expr, $pos:ident) => {{
        let progress = $crate::codec::Decode::decode(&mut $decoder, &$buf[$pos..])?;
        $pos += progress.consumed;
        match progress.value {
            Some(value) => value,
            None => return Ok($crate::codec::Progress::partial($pos)),
        }
    }};
}

pub(crate) use decode_field;

/// Single byte.
#[derive(Debug, Default)]
pub struct U8Decoder;

impl Decode for U8Decoder {
    type Output = u8;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<u8> {
        match buf.first() {
            Some(&byte) => Ok(Progress::complete(1, byte)),
            None => Ok(Progress::partial(0)),
        }
    }
}

/// Two-byte big-endian integer.
#[derive(Debug, Default)]
pub struct U16Decoder {
    bytes: [u8; 2],
    have: usize,
}

impl Decode for U16Decoder {
    type Output = u16;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<u16> {
        let take = (2 - self.have).min(buf.len());
        self.bytes[self.have..self.have + take].copy_from_slice(&buf[..take]);
        self.have += take;

        if self.have < 2 {
            return Ok(Progress::partial(take));
        }
        self.have = 0;
        Ok(Progress::complete(take, u16::from_be_bytes(self.bytes)))
    }
}

/// Upper bound on the up-front reservation. `len` comes off the wire, so the
/// buffer only grows past this as bytes actually arrive.
const MAX_PREALLOC: usize = 64 * 1024;

/// Exactly `len` raw bytes, with the length known up front.
#[derive(Debug, Default)]
pub struct RawDecoder {
    len: usize,
    body: Vec<u8>,
}

impl RawDecoder {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            body: Vec::with_capacity(len.min(MAX_PREALLOC)),
        }
    }
}

impl Decode for RawDecoder {
    type Output = Vec<u8>;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Vec<u8>> {
        let take = (self.len - self.body.len()).min(buf.len());
        self.body.extend_from_slice(&buf[..take]);

        if self.body.len() < self.len {
            return Ok(Progress::partial(take));
        }
        Ok(Progress::complete(take, std::mem::take(&mut self.body)))
    }
}

/// Two-byte length prefix followed by that many bytes. The length and the body
/// are resumable independently.
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    length: U16Decoder,
    body: Option<RawDecoder>,
}

impl Decode for BinaryDecoder {
    type Output = Vec<u8>;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<Vec<u8>> {
        let mut pos = 0;
        if self.body.is_none() {
            let len = decode_field!(self.length, buf, pos);
            self.body = Some(RawDecoder::new(len as usize));
        }

        let Some(body) = self.body.as_mut() else {
            return Ok(Progress::partial(pos));
        };
        let progress = body.decode(&buf[pos..])?;
        pos += progress.consumed;
        match progress.value {
            Some(bytes) => {
                self.body = None;
                Ok(Progress::complete(pos, bytes))
            }
            None => Ok(Progress::partial(pos)),
        }
    }
}

/// Length-prefixed UTF-8 string.
#[derive(Debug, Default)]
pub struct StringDecoder {
    inner: BinaryDecoder,
}

impl Decode for StringDecoder {
    type Output = String;

    fn decode(&mut self, buf: &[u8]) -> DecodeResult<String> {
        let progress = self.inner.decode(buf)?;
        let Some(bytes) = progress.value else {
            return Ok(Progress::partial(progress.consumed));
        };
        // MQTT-1.5.3-2: must not contain U+0000
        if bytes.contains(&0u8) {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        let value = String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Ok(Progress::complete(progress.consumed, value))
    }
}

// === Encoding ===

#[inline]
pub fn put_u16(value: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append a length-prefixed byte string.
#[inline]
pub fn put_binary(bytes: &[u8], buf: &mut Vec<u8>) {
    debug_assert!(bytes.len() <= u16::MAX as usize);
    put_u16(bytes.len() as u16, buf);
    buf.extend_from_slice(bytes);
}

/// Append a length-prefixed UTF-8 string.
#[inline]
pub fn put_str(value: &str, buf: &mut Vec<u8>) {
    put_binary(value.as_bytes(), buf);
}

/// Encoded size of a length-prefixed field.
#[inline]
pub fn prefixed_len(bytes: &[u8]) -> usize {
    2 + bytes.len()
}
