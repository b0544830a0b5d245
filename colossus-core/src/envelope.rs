//! Envelope framing: `[type][reserved][u16 BE length][payload][SHA-256 checksum]`.
//!
//! The checksum covers the header and the payload. A frame that fails
//! verification is rejected as a whole; nothing from it reaches a protocol.

use sha2::{Digest, Sha256};

use crate::protocol::Message;

const HEADER_SIZE: usize = 4;
/// Width of the trailing checksum (SHA-256).
pub const CHECKSUM_SIZE: usize = 32;
/// Default ceiling for a single payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 32 * 1024;
/// Hard ceiling imposed by the u16 length field.
pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;

/// Error framing or unframing an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope checksum mismatch")]
    ChecksumMismatch,
    #[error("envelope truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("entity too large: {len} bytes exceeds {max}")]
    EntityTooLarge { len: usize, max: usize },
    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),
    #[error("stream desynchronized by an earlier framing error")]
    Desynchronized,
}

fn checksum(bytes: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn check_limit(max_payload: usize) -> usize {
    max_payload.min(MAX_WIRE_PAYLOAD)
}

/// Frame one message with the default payload ceiling.
pub fn serialize(message_type: u8, payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    serialize_with_limit(message_type, payload, DEFAULT_MAX_PAYLOAD)
}

/// Frame one message, rejecting payloads above `max_payload`.
pub fn serialize_with_limit(
    message_type: u8,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<u8>, EnvelopeError> {
    let max = check_limit(max_payload);
    if payload.len() > max {
        return Err(EnvelopeError::EntityTooLarge {
            len: payload.len(),
            max,
        });
    }
    let len = payload.len() as u16;
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len() + CHECKSUM_SIZE);
    out.push(message_type);
    out.push(0);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    let digest = checksum(&out);
    out.extend_from_slice(&digest);
    Ok(out)
}

/// Decode one frame from the front of `bytes`.
/// Returns `Ok(None)` when more bytes are needed, otherwise the message and the bytes consumed.
fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<Option<(Message, usize)>, EnvelopeError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }
    let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let max = check_limit(max_payload);
    if len > max {
        return Err(EnvelopeError::EntityTooLarge { len, max });
    }
    let body_end = HEADER_SIZE + len;
    let frame_len = body_end + CHECKSUM_SIZE;
    if bytes.len() < frame_len {
        return Ok(None);
    }
    let expected = checksum(&bytes[..body_end]);
    if expected[..] != bytes[body_end..frame_len] {
        return Err(EnvelopeError::ChecksumMismatch);
    }
    let message = Message::new(bytes[0], bytes[HEADER_SIZE..body_end].to_vec());
    Ok(Some((message, frame_len)))
}

/// Parse exactly one complete frame with the default payload ceiling.
pub fn parse(bytes: &[u8]) -> Result<Message, EnvelopeError> {
    parse_with_limit(bytes, DEFAULT_MAX_PAYLOAD)
}

/// Parse exactly one complete frame.
pub fn parse_with_limit(bytes: &[u8], max_payload: usize) -> Result<Message, EnvelopeError> {
    match decode_frame(bytes, max_payload)? {
        Some((message, used)) if used == bytes.len() => Ok(message),
        Some((_, used)) => Err(EnvelopeError::TrailingBytes(bytes.len() - used)),
        None => {
            let needed = if bytes.len() < HEADER_SIZE {
                HEADER_SIZE + CHECKSUM_SIZE
            } else {
                HEADER_SIZE + u16::from_be_bytes([bytes[2], bytes[3]]) as usize + CHECKSUM_SIZE
            };
            Err(EnvelopeError::Truncated {
                needed,
                available: bytes.len(),
            })
        }
    }
}

/// Push-based framing: every written message yields one framed buffer.
#[derive(Debug, Clone)]
pub struct Serializer {
    max_payload: usize,
}

impl Serializer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: check_limit(max_payload),
        }
    }

    pub fn write(&mut self, message: &Message) -> Result<Vec<u8>, EnvelopeError> {
        serialize_with_limit(message.message_type, &message.payload, self.max_payload)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

/// Push-based unframing. Feed arbitrary chunks; pull complete messages.
///
/// The length prefix is the only frame boundary, so after a framing error the
/// position of the next frame is unknown. The deserializer then stays poisoned
/// and the connection has to be reset.
#[derive(Debug)]
pub struct Deserializer {
    buf: Vec<u8>,
    max_payload: usize,
    poisoned: bool,
}

impl Deserializer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload: check_limit(max_payload),
            poisoned: false,
        }
    }

    /// Append received bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Next complete message, or `Ok(None)` if a full frame is not buffered yet.
    pub fn next_message(&mut self) -> Result<Option<Message>, EnvelopeError> {
        if self.poisoned {
            return Err(EnvelopeError::Desynchronized);
        }
        match decode_frame(&self.buf, self.max_payload) {
            Ok(Some((message, used))) => {
                self.buf.drain(..used);
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.poisoned = true;
                self.buf.clear();
                Err(e)
            }
        }
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

impl Default for Deserializer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}
