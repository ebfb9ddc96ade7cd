use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DriverError, DriverResult};

/// `[length: 4 bytes BE][tag: 1 byte]`
pub const HEADER_LEN: usize = 5;
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One decoded envelope: message-type tag plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Value of the length prefix for this frame.
    pub fn wire_length(&self) -> u32 {
        (self.payload.len() + 1) as u32
    }
}

pub fn encode_frame(tag: u8, payload: &[u8], dst: &mut BytesMut) -> DriverResult<()> {
    if payload.len() + 1 > MAX_FRAME_SIZE {
        return Err(DriverError::MessageTooLarge(payload.len() + 1));
    }

    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u32((payload.len() + 1) as u32);
    dst.put_u8(tag);
    dst.put_slice(payload);
    Ok(())
}

/// Validates a header and returns `(tag, payload_len)`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> DriverResult<(u8, usize)> {
    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length == 0 {
        return Err(DriverError::communication(
            "Frame length 0 leaves no room for a message tag",
        ));
    }
    if length > MAX_FRAME_SIZE {
        return Err(DriverError::MessageTooLarge(length));
    }
    Ok((header[4], length - 1))
}

/// Pulls one complete frame off the front of `src`, or `None` if more bytes
/// are needed.
pub fn decode_frame(src: &mut BytesMut) -> DriverResult<Option<Frame>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&src[..HEADER_LEN]);
    let (tag, payload_len) = decode_header(&header)?;

    if src.len() < HEADER_LEN + payload_len {
        src.reserve(HEADER_LEN + payload_len - src.len());
        return Ok(None);
    }

    src.advance(HEADER_LEN);
    let payload = src.split_to(payload_len).freeze();
    Ok(Some(Frame { tag, payload }))
}

pub fn encode_msgpack<T: Serialize>(value: &T) -> DriverResult<Vec<u8>> {
    rmp_serde::to_vec_named(value)
        .map_err(|e| DriverError::InvalidRequest(format!("Serialization failed: {}", e)))
}

pub fn decode_msgpack<T: DeserializeOwned>(data: &[u8]) -> DriverResult<T> {
    rmp_serde::from_slice(data)
        .map_err(|e| DriverError::InvalidResponse(format!("Deserialization failed: {}", e)))
}
