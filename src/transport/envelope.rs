//! Binary envelope framing used on the TCP interface.
//!
//! ```text
//! offset  size  field
//!      0     2  "#!"
//!      2     4  message type      (u32, big-endian)
//!      6     8  time              (u64, unix seconds)
//!     14     4  meta type         (u32)
//!     18     4  meta length       (u32)
//!     22     4  data length       (u32)
//!     26     4  "!#\r\n"
//!     30     …  meta (JSON), then data
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RackError;

/// Header length in bytes.
pub const HEADER_LEN: usize = 30;
/// Largest accepted `meta + data` size.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// Meta type tag for JSON meta.
pub const META_TYPE_JSON: u32 = 0x0001_0000;
/// Message type tag the server uses for its own envelopes.
pub const MESSAGE_TYPE_DEFAULT: u32 = 0;

const START: &[u8; 2] = b"#!";
const END: &[u8; 4] = b"!#\r\n";

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Message type tag.
    pub message_type: u32,
    /// Sender time, unix seconds.
    pub time: u64,
    /// Meta type tag.
    pub meta_type: u32,
    /// Raw meta bytes, JSON for [`META_TYPE_JSON`].
    pub meta: Bytes,
    /// Opaque payload.
    pub data: Bytes,
}

impl Envelope {
    /// Envelope with JSON `meta`, no data, stamped with the current time.
    pub fn with_meta(meta: &Value) -> Self {
        Self {
            message_type: MESSAGE_TYPE_DEFAULT,
            time: chrono::Utc::now().timestamp().max(0) as u64,
            meta_type: META_TYPE_JSON,
            meta: Bytes::from(meta.to_string()),
            data: Bytes::new(),
        }
    }

    /// Parses the meta section. Empty meta reads as `{}`.
    pub fn meta_json(&self) -> Result<Value, serde_json::Error> {
        if self.meta.is_empty() {
            Ok(Value::Object(serde_json::Map::new()))
        } else {
            serde_json::from_slice(&self.meta)
        }
    }
}

/// `tokio_util` codec for [`Envelope`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

struct Header {
    message_type: u32,
    time: u64,
    meta_type: u32,
    meta_len: usize,
    data_len: usize,
}

fn parse_header(src: &[u8]) -> Result<Header, RackError> {
    if &src[0..2] != START {
        return Err(RackError::Envelope(format!(
            "bad start marker {:02x?}",
            &src[0..2]
        )));
    }
    if &src[26..30] != END {
        return Err(RackError::Envelope(format!(
            "bad header terminator {:02x?}",
            &src[26..30]
        )));
    }
    let mut fields = &src[2..26];
    let message_type = fields.get_u32();
    let time = fields.get_u64();
    let meta_type = fields.get_u32();
    let meta_len = fields.get_u32() as usize;
    let data_len = fields.get_u32() as usize;

    if meta_len.saturating_add(data_len) > MAX_FRAME_LEN {
        return Err(RackError::Envelope(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            meta_len.saturating_add(data_len)
        )));
    }
    Ok(Header {
        message_type,
        time,
        meta_type,
        meta_len,
        data_len,
    })
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = RackError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, RackError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = parse_header(&src[..HEADER_LEN])?;
        let total = HEADER_LEN + header.meta_len + header.data_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let meta = src.split_to(header.meta_len).freeze();
        let data = src.split_to(header.data_len).freeze();

        Ok(Some(Envelope {
            message_type: header.message_type,
            time: header.time,
            meta_type: header.meta_type,
            meta,
            data,
        }))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = RackError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), RackError> {
        let meta = item.meta;
        if meta.len() + item.data.len() > MAX_FRAME_LEN {
            return Err(RackError::Envelope(format!(
                "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
                meta.len() + item.data.len()
            )));
        }

        dst.reserve(HEADER_LEN + meta.len() + item.data.len());
        dst.put_slice(START);
        dst.put_u32(item.message_type);
        dst.put_u64(item.time);
        dst.put_u32(item.meta_type);
        dst.put_u32(meta.len() as u32);
        dst.put_u32(item.data.len() as u32);
        dst.put_slice(END);
        dst.put_slice(&meta);
        dst.put_slice(&item.data);
        Ok(())
    }
}
