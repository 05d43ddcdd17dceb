//! Frame codec.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +---------+----------------+-------------------------------+
//! | "PFKT"  | u32 LE length  | CBOR {route, parameter}       |
//! +---------+----------------+-------------------------------+
//!   4 bytes    4 bytes          `length` bytes
//! ```

use bytes::{Buf, BytesMut};

use perfkit_core::{Error, Result};

use crate::Envelope;

/// Frame magic token.
pub const MAGIC: [u8; 4] = *b"PFKT";

/// Magic plus length prefix.
pub const HEADER_LEN: usize = 8;

/// Largest accepted payload length.
pub const MAX_FRAME_LEN: usize = 128 << 20;

/// Encode an envelope into one complete frame.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(envelope, &mut payload).map_err(|e| Error::Frame(e.to_string()))?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::OversizedFrame {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a frame header and return the declared payload length.
pub fn parse_header(header: &[u8], max_len: usize) -> Result<usize> {
    if header.len() < HEADER_LEN {
        return Err(Error::Frame(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            header.len()
        )));
    }
    if header[..4] != MAGIC {
        return Err(Error::Frame(format!("bad magic {:02x?}", &header[..4])));
    }

    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > max_len {
        return Err(Error::OversizedFrame { len, max: max_len });
    }
    Ok(len)
}

/// Decode a frame payload into an envelope.
pub fn decode_payload(payload: &[u8]) -> Result<Envelope> {
    ciborium::from_reader(payload).map_err(|e| Error::MalformedPayload(e.to_string()))
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default length limit.
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    /// Create a decoder with a custom length limit.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_len,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if any.
    ///
    /// A header error ([`Error::Frame`], [`Error::OversizedFrame`]) is fatal
    /// for the stream: the caller must close the connection. A payload error
    /// ([`Error::MalformedPayload`]) consumes only its own frame, so decoding
    /// may continue.
    pub fn next_frame(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = parse_header(&self.buffer[..HEADER_LEN], self.max_len)?;
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len);
        decode_payload(&payload).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
