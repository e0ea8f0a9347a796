//! Multiplexed tag/length framing.
//!
//! Once a session finishes its argument exchange, both directions share one
//! byte pipe through frames of the form `[4-byte little-endian header]
//! [payload]`, where the header packs `(tag + MPLEX_BASE) << 24 | length`.
//! The data stream travels under [`MessageTag::Data`]; informational and
//! error text ride alongside under their own tags and are surfaced as log
//! events rather than parsed further.

use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::framing::ByteWindow;

/// Offset added to every tag code before it is packed into the header byte.
pub const MPLEX_BASE: u8 = 7;

/// Largest payload a single frame can carry (24-bit length field).
pub const MAX_PAYLOAD_LENGTH: usize = 0x00FF_FFFF;

/// Number of bytes in a frame header.
pub const HEADER_LEN: usize = 4;

/// Tags carried by multiplexed frames.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum MessageTag {
    /// Payload bytes belonging to the main protocol stream.
    Data = 0,
    /// Fatal transfer error text.
    ErrorXfer = 1,
    /// Informational text.
    Info = 2,
    /// Non-fatal error text.
    Error = 3,
}

impl MessageTag {
    /// Returns the tag matching a wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Data),
            1 => Some(Self::ErrorXfer),
            2 => Some(Self::Info),
            3 => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns the wire code of this tag.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Encodes the frame header for tag code `code` and a `len`-byte payload.
///
/// # Errors
///
/// [`ProtocolError::OversizedPayload`] when `len` exceeds the 24-bit frame
/// limit, [`ProtocolError::InvalidMultiplexTag`] when `code` cannot be
/// offset into the header byte.
pub fn encode_frame_header(code: u8, len: usize) -> Result<[u8; HEADER_LEN], ProtocolError> {
    if len > MAX_PAYLOAD_LENGTH {
        return Err(ProtocolError::OversizedPayload(len));
    }
    let tag = code
        .checked_add(MPLEX_BASE)
        .ok_or(ProtocolError::InvalidMultiplexTag(code))?;
    let raw = (u32::from(tag) << 24) | len as u32;
    Ok(raw.to_le_bytes())
}

/// Inbound demultiplexer inserted ahead of the session decoder.
///
/// The decoder buffers raw bytes, unpacks whole frames, and forwards only
/// [`MessageTag::Data`] payloads; error and info frames become log events
/// and unknown tag codes are logged and skipped. It yields when fewer than
/// [`HEADER_LEN`] header bytes are buffered or a declared payload has not
/// fully arrived.
#[derive(Debug, Default)]
pub struct MultiplexDecoder {
    window: ByteWindow,
}

impl MultiplexDecoder {
    /// Creates a decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw inbound bytes to the decoder's buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.window.extend(bytes);
    }

    /// Unpacks frames until a data payload is complete.
    ///
    /// Returns `Ok(None)` when no complete data frame is buffered yet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidMultiplexTag`] when a header's tag byte falls
    /// below [`MPLEX_BASE`] and therefore cannot encode any tag.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let Some(raw) = self.window.peek_u32_le() else {
                return Ok(None);
            };
            let tag_byte = (raw >> 24) as u8;
            if tag_byte < MPLEX_BASE {
                return Err(ProtocolError::InvalidMultiplexTag(tag_byte));
            }
            let len = (raw & MAX_PAYLOAD_LENGTH as u32) as usize;
            if self.window.remaining() < HEADER_LEN + len {
                return Ok(None);
            }
            self.window.advance(HEADER_LEN);
            let payload = self.window.take(len);
            match MessageTag::from_code(tag_byte - MPLEX_BASE) {
                Some(MessageTag::Data) => return Ok(Some(payload)),
                Some(MessageTag::Info) => {
                    debug!(text = %String::from_utf8_lossy(&payload), "peer info");
                }
                Some(tag) => {
                    warn!(?tag, text = %String::from_utf8_lossy(&payload), "peer error");
                }
                None => {
                    debug!(code = tag_byte - MPLEX_BASE, len, "skipping unknown multiplex tag");
                }
            }
        }
    }
}
