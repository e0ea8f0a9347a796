//! Wire messages crossing the codec boundary.

use crate::error::ProtocolError;
use crate::framing::ByteWindow;

/// Prefix opening every handshake line.
pub const HANDSHAKE_PREFIX: &str = "@RSYNCD:";

/// Oldest protocol generation the daemon will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 27;

/// Number of payload bytes in a generator request's sum head.
pub const SUM_HEAD_LEN: usize = 16;

/// Messages exchanged between the byte stream and the session handler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WireMessage {
    /// Protocol version announcement, `@RSYNCD: <major>.<minor>`.
    Handshake {
        /// Major protocol number.
        major: u32,
        /// Minor protocol number.
        minor: u32,
    },
    /// Module selection line sent by the client.
    Command(String),
    /// Completed server-style argument list.
    Arguments(Vec<String>),
    /// Completed filter rule list, passed through unparsed.
    Filters(Vec<String>),
    /// One generator request for a file-list index.
    Generator(GeneratorMessage),
    /// End of the generator's request list.
    ListDone,
    /// Session setup: compatibility flags plus the checksum challenge seed.
    Setup {
        /// Compatibility flag byte.
        flags: u8,
        /// Checksum seed offered to the client.
        seed: u32,
    },
    /// Free-form response text for the client.
    Response(String),
    /// Opaque payload produced by the transfer layer.
    Protocol(Vec<u8>),
    /// Error line delivered to the client.
    Error {
        /// Multiplex tag code used once multiplexing is engaged.
        code: u8,
        /// Error text without trailing newline.
        text: String,
    },
}

impl WireMessage {
    /// Short kind name used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Handshake { .. } => "handshake",
            Self::Command(_) => "command",
            Self::Arguments(_) => "arguments",
            Self::Filters(_) => "filters",
            Self::Generator(_) => "generator",
            Self::ListDone => "list-done",
            Self::Setup { .. } => "setup",
            Self::Response(_) => "response",
            Self::Protocol(_) => "protocol",
            Self::Error { .. } => "error",
        }
    }
}

/// Parses a handshake line of the form `@RSYNCD: <major>.<minor>`.
///
/// The fractional part is optional: `@RSYNCD: 27` reads as protocol 27.0.
/// Generations newer than ours are accepted here; the session layer clamps
/// its reply to what it actually speaks.
///
/// # Errors
///
/// [`ProtocolError::Startup`] for lines that do not match the grammar,
/// [`ProtocolError::IncompatibleVersion`] for generations older than
/// [`MIN_PROTOCOL_VERSION`].
pub fn parse_handshake(line: &str) -> Result<(u32, u32), ProtocolError> {
    let rest = line
        .trim_end_matches('\r')
        .strip_prefix(HANDSHAKE_PREFIX)
        .ok_or(ProtocolError::Startup)?
        .trim();
    let (major_text, minor_text) = match rest.split_once('.') {
        Some((major, minor)) => (major, Some(minor)),
        None => (rest, None),
    };
    let major = parse_decimal(major_text)?;
    let minor = match minor_text {
        Some(text) => parse_decimal(text)?,
        None => 0,
    };
    if major < MIN_PROTOCOL_VERSION {
        return Err(ProtocolError::IncompatibleVersion { major, minor });
    }
    Ok((major, minor))
}

fn parse_decimal(text: &str) -> Result<u32, ProtocolError> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::Startup);
    }
    text.parse().map_err(|_| ProtocolError::Startup)
}

/// Generator request carrying a file-list index and its sum head.
///
/// The sum-head bytes may arrive spread across many reads; the message
/// accumulates them until all [`SUM_HEAD_LEN`] are present and only then
/// reports itself complete.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratorMessage {
    index: i32,
    payload: Vec<u8>,
}

impl GeneratorMessage {
    /// Starts an empty request for `index`.
    #[must_use]
    pub fn new(index: i32) -> Self {
        Self {
            index,
            payload: Vec::with_capacity(SUM_HEAD_LEN),
        }
    }

    /// Returns the requested file-list index.
    #[must_use]
    pub const fn index(&self) -> i32 {
        self.index
    }

    /// Returns the payload bytes accumulated so far.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// True once the whole sum head has been absorbed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.payload.len() == SUM_HEAD_LEN
    }

    /// Absorbs buffered bytes into the payload and reports completion.
    pub fn absorb(&mut self, window: &mut ByteWindow) -> bool {
        let wanted = SUM_HEAD_LEN - self.payload.len();
        let take = wanted.min(window.remaining());
        if take > 0 {
            self.payload.extend_from_slice(&window.as_slice()[..take]);
            window.advance(take);
        }
        self.is_complete()
    }

    /// Decodes the sum head, once complete.
    #[must_use]
    pub fn sum_head(&self) -> Option<SumHead> {
        if !self.is_complete() {
            return None;
        }
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(self.payload.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(SumHead {
            block_count: words[0],
            block_length: words[1],
            strong_sum_length: words[2],
            remainder: words[3],
        })
    }
}

/// Checksum geometry opening a generator request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SumHead {
    /// Number of checksummed blocks the client already holds.
    pub block_count: u32,
    /// Length of each full block.
    pub block_length: u32,
    /// Strong checksum bytes kept per block.
    pub strong_sum_length: u32,
    /// Length of the trailing short block.
    pub remainder: u32,
}
