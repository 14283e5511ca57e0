// src/core/protocol/frame.rs

//! Implements the IPROTO frame structure and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! A frame is a MessagePack unsigned integer holding the payload length,
//! followed by the payload: a header map and an optional body map. The codec
//! interprets the header only; the body stays opaque bytes.

use super::constants::header_key;
use crate::core::TntError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmpv::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected unless the codec is configured otherwise.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// The encoder always writes the length as `0xce` followed by a big-endian u32.
const LENGTH_PREFIX_LEN: usize = 5;
const MARKER_U8: u8 = 0xcc;
const MARKER_U16: u8 = 0xcd;
const MARKER_U32: u8 = 0xce;
const MARKER_U64: u8 = 0xcf;

/// The fixed-field part of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Request type for outbound frames, response status for inbound ones.
    pub code: u32,
    /// Correlation id.
    pub sync: u64,
    /// Schema version. `0` means "not reported" and is not encoded.
    pub schema_version: u64,
}

impl Header {
    pub fn new(code: u32, sync: u64) -> Self {
        Self {
            code,
            sync,
            schema_version: 0,
        }
    }
}

/// An immutable wire unit: header plus raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// Encodes the frame into a standalone byte vector.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, TntError> {
        let mut buf = BytesMut::new();
        encode(&self.header, &self.body, &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// Appends one complete frame to `dst`. An empty body is omitted entirely.
pub fn encode(header: &Header, body: &[u8], dst: &mut BytesMut) -> Result<(), TntError> {
    let start = dst.len();
    dst.reserve(LENGTH_PREFIX_LEN + 16 + body.len());
    dst.put_u8(MARKER_U32);
    dst.put_u32(0);

    {
        let mut w = (&mut *dst).writer();
        let fields = if header.schema_version != 0 { 3 } else { 2 };
        rmp::encode::write_map_len(&mut w, fields)?;
        rmp::encode::write_uint(&mut w, u64::from(header_key::CODE))?;
        rmp::encode::write_uint(&mut w, u64::from(header.code))?;
        rmp::encode::write_uint(&mut w, u64::from(header_key::SYNC))?;
        rmp::encode::write_uint(&mut w, header.sync)?;
        if header.schema_version != 0 {
            rmp::encode::write_uint(&mut w, u64::from(header_key::SCHEMA_VERSION))?;
            rmp::encode::write_uint(&mut w, header.schema_version)?;
        }
    }
    dst.extend_from_slice(body);

    let payload_len = dst.len() - start - LENGTH_PREFIX_LEN;
    let payload_len = u32::try_from(payload_len).map_err(|_| {
        dst.truncate(start);
        TntError::Protocol(format!("frame payload of {payload_len} bytes cannot be encoded"))
    })?;
    dst[start + 1..start + LENGTH_PREFIX_LEN].copy_from_slice(&payload_len.to_be_bytes());
    Ok(())
}

/// Decodes one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a complete frame, and
/// `Ok(Some((frame, consumed)))` otherwise. The body is copied out of `src`.
pub fn decode(src: &[u8], max_frame_size: usize) -> Result<Option<(Frame, usize)>, TntError> {
    let Some((prefix_len, total_len)) = frame_bounds(src, max_frame_size)? else {
        return Ok(None);
    };
    let payload = &src[prefix_len..total_len];
    let (header, header_len) = decode_header(payload)?;
    let body = Bytes::copy_from_slice(&payload[header_len..]);
    Ok(Some((Frame { header, body }, total_len)))
}

/// Reads the length prefix and returns `(prefix_len, total_frame_len)`, or
/// `None` if more bytes are needed.
fn frame_bounds(src: &[u8], max_frame_size: usize) -> Result<Option<(usize, usize)>, TntError> {
    let Some(&marker) = src.first() else {
        return Ok(None);
    };

    let prefix_len = match marker {
        0x00..=0x7f => 1,
        MARKER_U8 => 2,
        MARKER_U16 => 3,
        MARKER_U32 => 5,
        MARKER_U64 => 9,
        other => {
            return Err(TntError::Protocol(format!(
                "invalid length prefix marker 0x{other:02x}"
            )));
        }
    };
    if src.len() < prefix_len {
        return Ok(None);
    }

    let mut prefix = &src[1..prefix_len];
    let payload_len: u64 = match marker {
        MARKER_U8 => u64::from(prefix.get_u8()),
        MARKER_U16 => u64::from(prefix.get_u16()),
        MARKER_U32 => u64::from(prefix.get_u32()),
        MARKER_U64 => prefix.get_u64(),
        fixint => u64::from(fixint),
    };

    if payload_len > max_frame_size as u64 {
        return Err(TntError::FrameTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }
    let total_len = prefix_len + payload_len as usize;
    if src.len() < total_len {
        return Ok(None);
    }
    Ok(Some((prefix_len, total_len)))
}

/// Parses the header map at the front of a complete payload. Returns the
/// header and the number of bytes it occupied.
fn decode_header(payload: &[u8]) -> Result<(Header, usize), TntError> {
    let mut rd = payload;
    let value = rmpv::decode::read_value(&mut rd)?;
    let consumed = payload.len() - rd.len();

    let Value::Map(entries) = value else {
        return Err(TntError::Protocol("frame header is not a map".to_string()));
    };

    let mut header = Header::default();
    for (key, value) in entries {
        let key = key
            .as_u64()
            .ok_or_else(|| TntError::Protocol("header key is not an unsigned integer".into()))?;
        match key {
            k if k == u64::from(header_key::CODE) => {
                header.code = header_uint(&value, "code", u64::from(u32::MAX))? as u32;
            }
            k if k == u64::from(header_key::SYNC) => {
                header.sync = header_uint(&value, "sync", u64::MAX)?;
            }
            k if k == u64::from(header_key::SCHEMA_VERSION) => {
                header.schema_version = header_uint(&value, "schema version", u64::MAX)?;
            }
            _ => {}
        }
    }
    Ok((header, consumed))
}

fn header_uint(value: &Value, field: &str, max: u64) -> Result<u64, TntError> {
    match value.as_u64() {
        Some(v) if v <= max => Ok(v),
        Some(v) => Err(TntError::Protocol(format!(
            "header field {field} out of range: {v}"
        ))),
        None => Err(TntError::Protocol(format!(
            "header field {field} is not an unsigned integer"
        ))),
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `Frame`s.
#[derive(Debug, Clone)]
pub struct IprotoCodec {
    max_frame_size: usize,
}

impl IprotoCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for IprotoCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Encoder<Frame> for IprotoCodec {
    type Error = TntError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode(&item.header, &item.body, dst)
    }
}

impl Decoder for IprotoCodec {
    type Item = Frame;
    type Error = TntError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((prefix_len, total_len)) = frame_bounds(src, self.max_frame_size)? else {
            // Reserve room for the rest of a frame whose length is already known.
            if let Some(hint) = pending_len_hint(src) {
                src.reserve(hint.saturating_sub(src.len()));
            }
            return Ok(None);
        };

        let mut payload = src.split_to(total_len).freeze();
        payload.advance(prefix_len);
        let (header, header_len) = decode_header(&payload)?;
        payload.advance(header_len);
        Ok(Some(Frame {
            header,
            body: payload,
        }))
    }
}

// Total frame length when the prefix is readable but the payload is not yet complete.
fn pending_len_hint(src: &[u8]) -> Option<usize> {
    if src.len() < LENGTH_PREFIX_LEN || src[0] != MARKER_U32 {
        return None;
    }
    let mut prefix = &src[1..LENGTH_PREFIX_LEN];
    Some(LENGTH_PREFIX_LEN + prefix.get_u32() as usize)
}
