//! u32 big-endian length-prefixed framing.
//!
//! A frame on the wire is `len: u32 (BE)` followed by `len` payload bytes.
//! The decoder is resynchronizable: feeding it partial input returns
//! `Ok(None)` and leaves the buffer untouched until the frame completes.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default maximum encoded frame size (4 MiB)
pub const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

/// Encode one payload as a length-prefixed frame
pub fn encode_frame(payload: &[u8], max_frame: usize) -> Result<Bytes, WireError> {
    if payload.len() > u32::MAX as usize {
        return Err(WireError::Malformed);
    }

    let total = payload.len() + 4;
    if total > max_frame {
        return Err(WireError::Size(total));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Incremental decoder for length-prefixed frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given maximum encoded frame size
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An oversized length
    /// prefix is unrecoverable since the stream cannot be resynchronized.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at the length prefix without consuming it
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len + 4 > self.max_frame {
            return Err(WireError::Size(frame_len + 4));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}
