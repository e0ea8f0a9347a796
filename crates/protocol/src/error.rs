//! Protocol error taxonomy.

use std::io;

use thiserror::Error;

/// Errors surfaced by the wire codec and session state machine.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ProtocolError {
    /// A delimited token outgrew its framing cap before terminating.
    #[error("token exceeded the {cap}-byte framing cap")]
    FramingOverflow {
        /// The cap that was exceeded.
        cap: usize,
    },
    /// The peer's startup lines did not match the protocol grammar.
    #[error("protocol startup error")]
    Startup,
    /// The announced protocol generation cannot be served.
    #[error("protocol version {major}.{minor} is not supported")]
    IncompatibleVersion {
        /// Major number announced by the peer.
        major: u32,
        /// Minor number announced by the peer.
        minor: u32,
    },
    /// The peer sent more arguments than a session accepts.
    #[error("argument list too long")]
    ArgumentLimitExceeded,
    /// A generator index decoded to a negative non-sentinel value.
    #[error("negative file index {0} outside the done sentinel")]
    IndexProtocol(i32),
    /// A frame header's tag byte cannot encode any multiplex tag.
    #[error("multiplex tag byte {0} is outside the tag range")]
    InvalidMultiplexTag(u8),
    /// A frame payload exceeded the 24-bit length field.
    #[error("payload of {0} bytes exceeds the multiplex frame limit")]
    OversizedPayload(usize),
    /// The message kind only travels inbound and cannot be serialized.
    #[error("{0} messages cannot be written to the peer")]
    Unencodable(&'static str),
}

impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> Self {
        let kind = match err {
            ProtocolError::FramingOverflow { .. }
            | ProtocolError::Startup
            | ProtocolError::IndexProtocol(_)
            | ProtocolError::InvalidMultiplexTag(_) => io::ErrorKind::InvalidData,
            ProtocolError::IncompatibleVersion { .. } => io::ErrorKind::Unsupported,
            ProtocolError::ArgumentLimitExceeded
            | ProtocolError::OversizedPayload(_)
            | ProtocolError::Unencodable(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}
