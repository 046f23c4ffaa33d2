//! Frame codec: header parsing and length-prefixed payload fields.

use crate::ProtoError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Header size in bytes (1 byte kind + 4 bytes big-endian length).
pub const HEADER_SIZE: usize = 5;

/// Maximum accepted payload size. The wire format allows up to u32::MAX but
/// control messages are tiny; anything near this limit is a broken or
/// hostile peer.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A raw frame as read off the wire, before the payload is interpreted.
///
/// The kind byte is kept raw so that unknown kinds can be reported (and
/// skipped) without losing the payload boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Try to decode one frame from the accumulation buffer.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame was consumed,
    /// `Ok(None)` when more data is needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtoError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }

        let kind = buf[0];
        let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtoError::FrameTooLarge(length));
        }

        if buf.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        buf.advance(HEADER_SIZE);
        let payload = buf.split_to(length).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

/// Write a `u8`-length-prefixed string field.
pub(crate) fn put_lstr8(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), ProtoError> {
    if value.len() > u8::MAX as usize {
        return Err(ProtoError::FieldTooLong(field));
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Write a `u32`-length-prefixed string field.
pub(crate) fn put_lstr32(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), ProtoError> {
    if value.len() > u32::MAX as usize {
        return Err(ProtoError::FieldTooLong(field));
    }
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Cursor over a frame payload with bounds-checked field readers.
pub(crate) struct PayloadReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub(crate) fn get_u8(&mut self, field: &'static str) -> Result<u8, ProtoError> {
        let b = *self
            .data
            .get(self.offset)
            .ok_or(ProtoError::MalformedFrame(field))?;
        self.offset += 1;
        Ok(b)
    }

    pub(crate) fn get_u32(&mut self, field: &'static str) -> Result<u32, ProtoError> {
        let end = self.offset + 4;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(ProtoError::MalformedFrame(field))?;
        self.offset = end;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_str(&mut self, len: usize, field: &'static str) -> Result<String, ProtoError> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or(ProtoError::MalformedFrame(field))?;
        let bytes = self
            .data
            .get(self.offset..end)
            .ok_or(ProtoError::MalformedFrame(field))?;
        self.offset = end;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::InvalidUtf8(field))
    }

    pub(crate) fn get_lstr8(&mut self, field: &'static str) -> Result<String, ProtoError> {
        let len = self.get_u8(field)? as usize;
        self.get_str(len, field)
    }

    pub(crate) fn get_lstr32(&mut self, field: &'static str) -> Result<String, ProtoError> {
        let len = self.get_u32(field)? as usize;
        self.get_str(len, field)
    }
}
