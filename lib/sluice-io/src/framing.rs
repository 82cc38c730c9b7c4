//! Length-delimited framing.
//!
//! Each frame is a 4-byte unsigned length, in little endian order, followed by exactly that many bytes of frame data.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::Snafu;
use tracing::trace;

const LENGTH_PREFIX_LEN: usize = 4;

/// A framing error.
#[derive(Debug, Snafu, Eq, PartialEq)]
#[snafu(context(suffix(false)))]
pub enum FramingError {
    /// The declared frame length is larger than the framer accepts.
    #[snafu(display("frame length {} exceeds maximum frame length {}", frame_len, max_frame_len))]
    FrameTooLarge {
        /// Declared length of the frame.
        frame_len: usize,

        /// Maximum frame length accepted by the framer.
        max_frame_len: usize,
    },

    /// The input ended in the middle of a frame.
    #[snafu(display("input ended with a partial frame ({} byte(s) left over)", buffer_len))]
    PartialFrame {
        /// Number of bytes left in the buffer.
        buffer_len: usize,
    },

    /// The payload is too large to describe with a 4-byte length.
    #[snafu(display("payload of {} bytes cannot be length-delimited", payload_len))]
    PayloadTooLarge {
        /// Length of the payload.
        payload_len: usize,
    },
}

/// Writes `payload` to `dst` as a single length-delimited frame.
///
/// # Errors
///
/// If the payload length does not fit in a `u32`, an error is returned and `dst` is left untouched.
pub fn write_length_delimited(payload: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
    let frame_len = u32::try_from(payload.len()).map_err(|_| FramingError::PayloadTooLarge {
        payload_len: payload.len(),
    })?;

    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32_le(frame_len);
    dst.put_slice(payload);
    Ok(())
}

/// Splits length-delimited frames out of a byte buffer.
#[derive(Clone, Debug)]
pub struct LengthDelimitedFramer {
    max_frame_len: usize,
}

impl LengthDelimitedFramer {
    /// Creates a new `LengthDelimitedFramer` that rejects frames longer than `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    /// Extracts the next frame from `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame and more data may still arrive. When `is_eof`
    /// is `true`, leftover bytes that do not form a complete frame are reported as an error instead.
    ///
    /// # Errors
    ///
    /// If the frame length exceeds the configured maximum, or the input ends mid-frame, an error is returned.
    pub fn next_frame(&mut self, buf: &mut BytesMut, is_eof: bool) -> Result<Option<Bytes>, FramingError> {
        trace!(buf_len = buf.len(), "Processing buffer.");

        if buf.is_empty() {
            return Ok(None);
        }

        if buf.len() < LENGTH_PREFIX_LEN {
            return incomplete(buf, is_eof);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
        let frame_len = u32::from_le_bytes(prefix) as usize;
        if frame_len > self.max_frame_len {
            return Err(FramingError::FrameTooLarge {
                frame_len,
                max_frame_len: self.max_frame_len,
            });
        }

        if buf.len() < LENGTH_PREFIX_LEN + frame_len {
            return incomplete(buf, is_eof);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }
}

fn incomplete(buf: &BytesMut, is_eof: bool) -> Result<Option<Bytes>, FramingError> {
    if is_eof {
        Err(FramingError::PartialFrame { buffer_len: buf.len() })
    } else {
        Ok(None)
    }
}
