//! Protobuf wire-format primitives.
//!
//! Only the subset the push-server frames use: varints, length-delimited
//! fields and `fixed32`. Writers follow proto3 rules and omit default values,
//! which keeps encoding canonical.

// ============================================================================
// Imports
// ============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Wire type of varint-encoded scalars.
pub(crate) const WIRE_VARINT: u8 = 0;

/// Wire type of 8-byte little-endian scalars.
pub(crate) const WIRE_FIXED64: u8 = 1;

/// Wire type of length-delimited fields.
pub(crate) const WIRE_LEN: u8 = 2;

/// Wire type of 4-byte little-endian scalars.
pub(crate) const WIRE_FIXED32: u8 = 5;

/// Longest valid varint (ten 7-bit groups).
const MAX_VARINT_LEN: usize = 10;

// ============================================================================
// Writers
// ============================================================================

pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub(crate) fn put_key(buf: &mut BytesMut, field: u32, wire_type: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

pub(crate) fn put_bytes(buf: &mut BytesMut, field: u32, value: &[u8]) {
    if value.is_empty() {
        return;
    }
    put_key(buf, field, WIRE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

pub(crate) fn put_string(buf: &mut BytesMut, field: u32, value: &str) {
    put_bytes(buf, field, value.as_bytes());
}

pub(crate) fn put_uint32(buf: &mut BytesMut, field: u32, value: u32) {
    if value == 0 {
        return;
    }
    put_key(buf, field, WIRE_VARINT);
    put_varint(buf, u64::from(value));
}

pub(crate) fn put_bool(buf: &mut BytesMut, field: u32, value: bool) {
    if !value {
        return;
    }
    put_key(buf, field, WIRE_VARINT);
    buf.put_u8(1);
}

pub(crate) fn put_fixed32(buf: &mut BytesMut, field: u32, value: u32) {
    if value == 0 {
        return;
    }
    put_key(buf, field, WIRE_FIXED32);
    buf.put_u32_le(value);
}

/// Writes an embedded message. Always emitted, even when empty, so oneof
/// members without fields survive a round trip.
pub(crate) fn put_message(buf: &mut BytesMut, field: u32, encode: impl FnOnce(&mut BytesMut)) {
    let mut inner = BytesMut::new();
    encode(&mut inner);
    put_key(buf, field, WIRE_LEN);
    put_varint(buf, inner.len() as u64);
    buf.put_slice(&inner);
}

// ============================================================================
// FieldValue
// ============================================================================

/// One decoded field payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    Len(Bytes),
    Fixed32(u32),
}

impl FieldValue {
    pub(crate) fn as_u32(&self) -> Result<u32> {
        match *self {
            Self::Varint(v) => u32::try_from(v)
                .map_err(|_| Error::decode(format!("varint {v} overflows uint32"))),
            Self::Fixed32(v) => Ok(v),
            _ => Err(Error::decode("expected a 32-bit scalar")),
        }
    }

    pub(crate) fn as_bool(&self) -> Result<bool> {
        match *self {
            Self::Varint(v) => Ok(v != 0),
            _ => Err(Error::decode("expected a bool")),
        }
    }

    pub(crate) fn into_bytes(self) -> Result<Bytes> {
        match self {
            Self::Len(bytes) => Ok(bytes),
            _ => Err(Error::decode("expected a length-delimited field")),
        }
    }

    pub(crate) fn into_string(self) -> Result<String> {
        let bytes = self.into_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::decode(format!("invalid utf-8 string: {e}")))
    }
}

// ============================================================================
// FieldReader
// ============================================================================

/// Iterates over the fields of one encoded message.
pub(crate) struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Returns the next `(field number, value)` pair, or `None` at the end.
    pub(crate) fn next_field(&mut self) -> Result<Option<(u32, FieldValue)>> {
        if !self.buf.has_remaining() {
            return Ok(None);
        }

        let key = get_varint(&mut self.buf)?;
        let field = u32::try_from(key >> 3)
            .map_err(|_| Error::decode(format!("field number out of range in key {key}")))?;
        if field == 0 {
            return Err(Error::decode("field number 0 is reserved"));
        }

        let value = match (key & 0x07) as u8 {
            WIRE_VARINT => FieldValue::Varint(get_varint(&mut self.buf)?),
            WIRE_FIXED64 => {
                ensure_remaining(&self.buf, 8)?;
                FieldValue::Fixed64(self.buf.get_u64_le())
            }
            WIRE_LEN => {
                let len = usize::try_from(get_varint(&mut self.buf)?)
                    .map_err(|_| Error::decode("length overflows usize"))?;
                ensure_remaining(&self.buf, len)?;
                FieldValue::Len(self.buf.split_to(len))
            }
            WIRE_FIXED32 => {
                ensure_remaining(&self.buf, 4)?;
                FieldValue::Fixed32(self.buf.get_u32_le())
            }
            other => return Err(Error::decode(format!("unsupported wire type {other}"))),
        };

        Ok(Some((field, value)))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn get_varint(buf: &mut Bytes) -> Result<u64> {
    let mut value = 0u64;
    for index in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::decode("truncated varint"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::decode("varint longer than 10 bytes"))
}

fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::decode(format!(
            "truncated field: need {needed} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
