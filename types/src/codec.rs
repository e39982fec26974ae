//! Length-delimited framing.
//!
//! ```text
//! length (varint, 1-10 bytes) || protobuf-encoded Frame (length bytes)
//! ```

use bytes::{Buf, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::frame::Frame;

/// Largest frame accepted unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("malformed length prefix")]
    BadLengthPrefix,

    #[error("frame decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("frame encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("unknown record kind {0}")]
    UnknownKind(i32),

    #[error("invalid frame: {0}")]
    Invalid(&'static str),
}

/// Appends `frame` with its length prefix to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<(), WireError> {
    let len = frame.encoded_len();
    dst.reserve(len + prost::length_delimiter_len(len));
    frame.encode_length_delimited(dst)?;
    Ok(())
}

/// Incremental decoder for a stream of length-delimited frames.
///
/// Bytes are appended to [`FrameDecoder::buffer_mut`] as they arrive;
/// [`FrameDecoder::decode`] yields complete frames and leaves partial ones
/// buffered until the rest shows up.
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_len,
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn decode(&mut self) -> Result<Option<Frame>, WireError> {
        let Some((len, prefix)) = peek_length(&self.buf)? else {
            return Ok(None);
        };

        if len > self.max_len {
            return Err(WireError::FrameTooLarge {
                len,
                limit: self.max_len,
            });
        }

        if self.buf.len() < prefix + len {
            self.buf.reserve(prefix + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(prefix);
        let body = self.buf.split_to(len).freeze();
        let frame = Frame::decode(body)?;
        Ok(Some(frame))
    }
}

/// Reads the varint length prefix without consuming it.
///
/// Returns `(length, prefix_len)`, or `None` if the prefix is still incomplete.
fn peek_length(buf: &[u8]) -> Result<Option<(usize, usize)>, WireError> {
    let Some(last) = buf.iter().take(MAX_VARINT_LEN).position(|byte| byte & 0x80 == 0) else {
        if buf.len() >= MAX_VARINT_LEN {
            return Err(WireError::BadLengthPrefix);
        }
        return Ok(None);
    };
    let len = prost::decode_length_delimiter(&buf[..=last])
        .map_err(|_| WireError::BadLengthPrefix)?;
    Ok(Some((len, last + 1)))
}
