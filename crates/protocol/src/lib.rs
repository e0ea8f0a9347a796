#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `protocol` implements the daemon side of the rsync wire protocol for the
//! read-only snapshot server: the byte-level framing, the multiplexed
//! tag/length envelope, the variable-length file-list index codec, and the
//! session state machine that turns an inbound byte stream into typed
//! [`WireMessage`] values and serializes outbound replies.
//!
//! # Design
//!
//! - [`ByteWindow`] provides the peek/commit buffer every decoder shares:
//!   a read either completes or consumes nothing, which makes decoding
//!   independent of how the peer's bytes were packetized.
//! - [`MultiplexDecoder`] unpacks the `(tag + 7) << 24 | length` frames that
//!   carry the data stream once a session's argument exchange finishes.
//! - [`IndexReader`] and [`IndexWriter`] are the stateful file-list index
//!   codec with the [`NDX_DONE`] sentinel.
//! - [`SessionCodec`] owns the per-session state machine; the surrounding
//!   [`SessionPipeline`] splices the demultiplexer in front of it when the
//!   codec requests the framing switch.
//!
//! The crate is transport-agnostic: nothing here performs I/O, and every
//! decode entry point returns control when input is insufficient, so a
//! connection scheduler can drive many sessions from one thread.
//!
//! # Errors
//!
//! Failures surface as [`ProtocolError`]. Conditions the peer must hear
//! about (startup framing problems, oversized argument lists) are handled
//! inside the codec, which queues an `@ERROR:` line and latches the session
//! closed; conditions that warrant silently dropping the connection, such
//! as a corrupt index, propagate as `Err`.
//!
//! # Examples
//!
//! ```
//! use protocol::{SessionCodec, SessionState, WireMessage};
//!
//! let mut codec = SessionCodec::new();
//! let mut messages = Vec::new();
//! codec.feed(b"@RSYNCD: 30.0\n", &mut messages)?;
//!
//! assert_eq!(messages, vec![WireMessage::Handshake { major: 30, minor: 0 }]);
//! assert_eq!(codec.state(), SessionState::Command);
//! # Ok::<(), protocol::ProtocolError>(())
//! ```

mod error;
mod framing;
mod index;
mod message;
mod multiplex;
mod session;

pub use error::ProtocolError;
pub use framing::ByteWindow;
pub use index::{IndexReader, IndexWriter, NDX_DONE};
pub use message::{
    parse_handshake, GeneratorMessage, SumHead, WireMessage, HANDSHAKE_PREFIX,
    MIN_PROTOCOL_VERSION, SUM_HEAD_LEN,
};
pub use multiplex::{
    encode_frame_header, MessageTag, MultiplexDecoder, HEADER_LEN, MAX_PAYLOAD_LENGTH, MPLEX_BASE,
};
pub use session::{
    SessionCodec, SessionPipeline, SessionState, ARGUMENT_CAP, COMMAND_LINE_CAP,
    HANDSHAKE_LINE_CAP, MAX_ARGUMENTS,
};
