//! Frame encoding and incremental decoding.

use std::collections::HashMap;

use crate::message::Message;
use crate::{MAGIC, MAX_HEADER_BYTES, PREAMBLE_LEN, VERSION};

/// Fatal protocol errors.
///
/// Any of these on the read side means the stream is unrecoverable and the
/// connection must be closed; partial frames are not errors (the decoder
/// simply waits for more bytes).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("bad frame magic 0x{found:08x}")]
    BadMagic { found: u32 },

    #[error("unsupported protocol version {found}")]
    UnsupportedVersion { found: u16 },

    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    BodyTooLarge { len: usize, max: usize },

    #[error("header block of {len} bytes does not fit the length field")]
    HeadersTooLarge { len: usize },
}

fn serialize_headers(headers: &HashMap<String, String>) -> String {
    let mut encoded = String::new();
    for (key, value) in headers {
        encoded.push_str(key);
        encoded.push('=');
        encoded.push_str(value);
        encoded.push('\n');
    }
    encoded
}

fn parse_headers(block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in block.split('\n') {
        if line.is_empty() {
            break;
        }
        // Lines without a separator are ignored rather than rejected.
        if let Some((key, value)) = line.split_once('=') {
            headers.insert(key.to_string(), value.to_string());
        }
    }
    headers
}

/// Encodes a message into a single wire frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let header_block = serialize_headers(&message.headers);
    if header_block.len() > MAX_HEADER_BYTES {
        return Err(WireError::HeadersTooLarge {
            len: header_block.len(),
        });
    }

    let mut frame = Vec::with_capacity(PREAMBLE_LEN + header_block.len() + message.body.len());
    frame.extend_from_slice(&MAGIC.to_be_bytes());
    frame.extend_from_slice(&VERSION.to_be_bytes());
    frame.extend_from_slice(&(header_block.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(message.body.len() as u32).to_be_bytes());
    frame.extend_from_slice(header_block.as_bytes());
    frame.extend_from_slice(&message.body);
    Ok(frame)
}

/// Incremental frame decoder over a growable buffer.
///
/// Bytes are appended as they arrive; [`try_next`](Self::try_next) yields one
/// decoded message at a time and `None` while a frame is incomplete. Once the
/// read cursor has consumed more than half the buffer, the consumed prefix is
/// discarded so memory stays bounded under sustained traffic.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    cursor: usize,
    max_body: usize,
}

impl FrameDecoder {
    /// Creates a decoder that rejects frames whose body exceeds `max_body`.
    pub fn new(max_body: usize) -> Self {
        Self {
            buf: Vec::new(),
            cursor: 0,
            max_body,
        }
    }

    /// Appends freshly received bytes.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes currently buffered (consumed prefix included).
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal for
    /// the stream.
    pub fn try_next(&mut self) -> Result<Option<Message>, WireError> {
        let available = self.buf.len() - self.cursor;
        if available < PREAMBLE_LEN {
            return Ok(None);
        }

        let at = |offset: usize| self.cursor + offset;
        let preamble = &self.buf[at(0)..at(PREAMBLE_LEN)];
        let magic = u32::from_be_bytes([preamble[0], preamble[1], preamble[2], preamble[3]]);
        let version = u16::from_be_bytes([preamble[4], preamble[5]]);
        let header_len = u16::from_be_bytes([preamble[6], preamble[7]]) as usize;
        let body_len =
            u32::from_be_bytes([preamble[8], preamble[9], preamble[10], preamble[11]]) as usize;

        if magic != MAGIC {
            return Err(WireError::BadMagic { found: magic });
        }
        if version != VERSION {
            return Err(WireError::UnsupportedVersion { found: version });
        }
        if body_len > self.max_body {
            return Err(WireError::BodyTooLarge {
                len: body_len,
                max: self.max_body,
            });
        }

        let frame_len = PREAMBLE_LEN + header_len + body_len;
        if available < frame_len {
            return Ok(None);
        }

        let header_block =
            String::from_utf8_lossy(&self.buf[at(PREAMBLE_LEN)..at(PREAMBLE_LEN + header_len)])
                .into_owned();
        let body = self.buf[at(PREAMBLE_LEN + header_len)..at(frame_len)].to_vec();

        self.cursor += frame_len;
        if self.cursor > self.buf.len() / 2 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }

        Ok(Some(Message {
            headers: parse_headers(&header_block),
            body,
        }))
    }
}
