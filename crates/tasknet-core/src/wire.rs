//! tasknet wire framing.
//!
//! One message per frame: an 8-byte packed header followed by the JSON
//! encoding of a [`Message`]. The header lets a reader size its buffer and
//! reject garbage before touching the body.
//!
//! The header is #[repr(C, packed)] with zerocopy derives. Multi-byte fields
//! are stored as little-endian byte arrays so the layout does not depend on
//! the host. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::{Message, MessageKind, ProtocolError};

/// Leading bytes of every frame.
pub const FRAME_MAGIC: [u8; 2] = *b"TN";

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;

/// Largest body accepted from a peer.
pub const MAX_FRAME_BODY: usize = 16 * 1024 * 1024;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Always `FRAME_MAGIC`.
    pub magic: [u8; 2],

    /// A receiver seeing an unknown version closes the connection.
    pub version: u8,

    /// `MessageKind` discriminant. Must match the body's `kind` tag.
    pub kind: u8,

    /// Body length in bytes, little-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

impl FrameHeader {
    pub fn new(kind: MessageKind, length: usize) -> Result<Self, ProtocolError> {
        if length > MAX_FRAME_BODY {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        Ok(Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: kind as u8,
            length: (length as u32).to_le_bytes(),
        })
    }

    /// Validate a received header, returning the kind and body length.
    pub fn parse(bytes: &[u8]) -> Result<(MessageKind, usize), ProtocolError> {
        let header = Self::read_from_prefix(bytes).ok_or(ProtocolError::Truncated {
            need: HEADER_LEN,
            have: bytes.len(),
        })?;
        if header.magic != FRAME_MAGIC {
            return Err(ProtocolError::BadMagic);
        }
        if header.version != FRAME_VERSION {
            return Err(ProtocolError::BadVersion(header.version));
        }
        let kind = MessageKind::from_u8(header.kind).ok_or(ProtocolError::UnknownKind(header.kind))?;
        let length = u32::from_le_bytes(header.length) as usize;
        if length > MAX_FRAME_BODY {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        Ok((kind, length))
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Header plus body, ready to write.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let body = msg.encode()?;
    let header = FrameHeader::new(msg.kind(), body.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a body whose header announced `kind`.
pub fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Message, ProtocolError> {
    let msg = Message::decode(body)?;
    if msg.kind() != kind {
        return Err(ProtocolError::KindMismatch {
            header: kind,
            body: msg.kind(),
        });
    }
    Ok(msg)
}

/// Decode one frame from the front of `buf`. Returns the message and the
/// number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let (kind, length) = FrameHeader::parse(buf)?;
    let need = HEADER_LEN + length;
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: buf.len(),
        });
    }
    let msg = decode_body(kind, &buf[HEADER_LEN..need])?;
    Ok((msg, need))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
