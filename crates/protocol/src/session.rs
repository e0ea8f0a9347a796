//! Session state machine and duplex codec.
//!
//! A session walks a linear chain of phases (handshake, command,
//! arguments, filter list) and then settles into the file-serving loop.
//! [`SessionCodec`] drives that chain over the already-demultiplexed data
//! stream: every [`feed`](SessionCodec::feed) either makes progress or
//! returns with the input buffered untouched, so the emitted messages are
//! identical no matter how the stream is chunked. [`SessionPipeline`] is
//! the full inbound assembly: it owns the [`MultiplexDecoder`] and splices
//! it ahead of the codec the moment the argument list terminates.
//!
//! Refusals the codec originates itself (`@ERROR:` lines for malformed
//! startup traffic) are queued on an internal outbound buffer and the
//! session latches closed; the connection owner flushes
//! [`take_outbound`](SessionCodec::take_outbound) and drops the socket.
//! Those lines are always written raw, even when the outbound multiplex
//! flag has already flipped.

use std::mem;

use tracing::debug;

use crate::error::ProtocolError;
use crate::framing::ByteWindow;
use crate::index::{IndexReader, NDX_DONE};
use crate::message::{parse_handshake, GeneratorMessage, WireMessage};
use crate::multiplex::{encode_frame_header, MessageTag, MultiplexDecoder};

/// Cap on the handshake line, terminator included.
pub const HANDSHAKE_LINE_CAP: usize = 16;

/// Cap on the module command line, terminator included.
pub const COMMAND_LINE_CAP: usize = 40;

/// Cap on a single argument token, terminator included.
pub const ARGUMENT_CAP: usize = 128;

/// Most arguments a client may send in one session.
pub const MAX_ARGUMENTS: usize = 20;

/// Phases of an inbound session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Waiting for the client's `@RSYNCD:` version line.
    Handshake,
    /// Waiting for the module selection line.
    Command,
    /// Collecting NUL-terminated server arguments.
    Arguments,
    /// Collecting length-prefixed filter rules.
    FilterList,
    /// Serving generator requests.
    SendFiles,
}

/// Duplex codec for one daemon session.
///
/// Decoding is state-driven and never blocks: insufficient input is a
/// normal return, and nothing is consumed that cannot be fully processed.
/// Encoding serializes outbound messages in place onto the caller's buffer,
/// wrapping data-bearing kinds in multiplex frames once the argument phase
/// has engaged multiplexing.
#[derive(Debug)]
pub struct SessionCodec {
    state: SessionState,
    multiplexing: bool,
    multiplex_requested: bool,
    window: ByteWindow,
    index_reader: IndexReader,
    pending: Option<GeneratorMessage>,
    arguments: Vec<String>,
    filters: Vec<String>,
    outbound: Vec<u8>,
    closed: bool,
}

impl Default for SessionCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCodec {
    /// Creates a codec for a fresh connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SessionState::Handshake,
            multiplexing: false,
            multiplex_requested: false,
            window: ByteWindow::new(),
            index_reader: IndexReader::new(),
            pending: None,
            arguments: Vec::new(),
            filters: Vec::new(),
            outbound: Vec::new(),
            closed: false,
        }
    }

    /// Current phase of the session.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// True once outbound messages are wrapped in multiplex frames.
    #[must_use]
    pub const fn is_multiplexing(&self) -> bool {
        self.multiplexing
    }

    /// True once the codec has decided the connection must close.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns queued codec-originated bytes for the owner to flush.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        mem::take(&mut self.outbound)
    }

    /// Reports, once, that the inbound demultiplexer should be engaged.
    pub fn take_multiplex_request(&mut self) -> bool {
        mem::take(&mut self.multiplex_requested)
    }

    /// Hands back bytes that were buffered but not yet parsed.
    pub fn drain_unparsed(&mut self) -> Vec<u8> {
        self.window.drain_all()
    }

    /// Feeds data-stream bytes and decodes every message they complete.
    ///
    /// Messages are appended to `out` in strict arrival order. Arrivals
    /// after the session has closed are ignored.
    ///
    /// # Errors
    ///
    /// Fatal conditions that warrant dropping the connection without a
    /// peer-visible message, such as [`ProtocolError::IndexProtocol`].
    /// Peer-reportable failures are handled internally: the refusal line is
    /// queued and the session closes.
    pub fn feed(&mut self, bytes: &[u8], out: &mut Vec<WireMessage>) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.window.extend(bytes);
        while !self.closed && self.window.remaining() > 0 && self.step(out)? {}
        Ok(())
    }

    fn step(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        match self.state {
            SessionState::Handshake => self.read_handshake(out),
            SessionState::Command => self.read_command(out),
            SessionState::Arguments => self.read_argument(out),
            SessionState::FilterList => self.read_filter(out),
            SessionState::SendFiles => self.read_generator(out),
        }
    }

    /// Queues a raw `@ERROR:` line and latches the session closed.
    fn refuse(&mut self, text: &str) {
        debug!(text, "refusing session");
        self.outbound.extend_from_slice(b"@ERROR: ");
        self.outbound.extend_from_slice(text.as_bytes());
        self.outbound.push(b'\n');
        self.closed = true;
    }

    fn read_handshake(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        let line = match self.window.delineated(HANDSHAKE_LINE_CAP, b'\n') {
            Ok(Some(line)) => Some(line),
            Ok(None) => return Ok(false),
            Err(_) => {
                self.refuse("protocol startup error");
                None
            }
        };
        if let Some(line) = line {
            match parse_handshake(&line) {
                Ok((major, minor)) => {
                    debug!(major, minor, "handshake received");
                    out.push(WireMessage::Handshake { major, minor });
                }
                Err(err) => self.refuse(&err.to_string()),
            }
        }
        // Leave the handshake phase even after a refusal so a dead session
        // can never be re-entered here.
        self.state = SessionState::Command;
        Ok(true)
    }

    fn read_command(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        let line = match self.window.delineated(COMMAND_LINE_CAP, b'\n') {
            Ok(Some(line)) => Some(line),
            Ok(None) => return Ok(false),
            Err(_) => {
                self.refuse("protocol startup error");
                None
            }
        };
        if let Some(command) = line {
            debug!(command = %command, "command received");
            out.push(WireMessage::Command(command));
        }
        self.state = SessionState::Arguments;
        Ok(true)
    }

    fn read_argument(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        // Outbound framing switches over as soon as the argument phase
        // begins; inbound framing follows once the terminator arrives.
        self.multiplexing = true;
        let token = match self.window.delineated(ARGUMENT_CAP, b'\0') {
            Ok(Some(token)) => token,
            Ok(None) => return Ok(false),
            Err(_) => {
                self.refuse("argument too long");
                return Ok(true);
            }
        };
        if token.is_empty() {
            debug!(arguments = ?self.arguments, "argument list complete");
            out.push(WireMessage::Arguments(mem::take(&mut self.arguments)));
            self.multiplex_requested = true;
            self.state = SessionState::FilterList;
        } else {
            self.arguments.push(token);
            if self.arguments.len() > MAX_ARGUMENTS {
                self.refuse(&ProtocolError::ArgumentLimitExceeded.to_string());
            }
        }
        Ok(true)
    }

    fn read_filter(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        let Some(len) = self.window.peek_u32_le() else {
            return Ok(false);
        };
        let len = len as usize;
        if len == 0 {
            self.window.advance(4);
            out.push(WireMessage::Filters(mem::take(&mut self.filters)));
            self.state = SessionState::SendFiles;
            return Ok(true);
        }
        if self.window.remaining() < 4 + len {
            // The length word stays unconsumed until its payload lands.
            return Ok(false);
        }
        self.window.advance(4);
        let raw = self.window.take(len);
        let filter = String::from_utf8_lossy(&raw).into_owned();
        debug!(filter = %filter, "filter recorded without interpretation");
        self.filters.push(filter);
        Ok(true)
    }

    fn read_generator(&mut self, out: &mut Vec<WireMessage>) -> Result<bool, ProtocolError> {
        if self.pending.is_none() {
            match self.index_reader.read(&mut self.window)? {
                None => return Ok(false),
                Some(NDX_DONE) => {
                    out.push(WireMessage::ListDone);
                    return Ok(true);
                }
                Some(index) => self.pending = Some(GeneratorMessage::new(index)),
            }
        }
        if let Some(mut pending) = self.pending.take() {
            if pending.absorb(&mut self.window) {
                out.push(WireMessage::Generator(pending));
                return Ok(true);
            }
            self.pending = Some(pending);
        }
        Ok(false)
    }

    /// Serializes an outbound message onto `out`.
    ///
    /// The frame header and payload are appended in place; no intermediate
    /// buffer is allocated per message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Unencodable`] for inbound-only kinds (the caller
    /// closes the connection), [`ProtocolError::OversizedPayload`] when a
    /// multiplexed payload exceeds the 24-bit frame limit.
    pub fn write(&mut self, message: &WireMessage, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match message {
            WireMessage::Handshake { major, minor } => {
                out.extend_from_slice(format!("@RSYNCD: {major}.{minor}\n").as_bytes());
            }
            WireMessage::Setup { flags, seed } => {
                out.push(*flags);
                out.extend_from_slice(&seed.to_le_bytes());
            }
            WireMessage::Response(text) => {
                if self.multiplexing {
                    out.extend_from_slice(&encode_frame_header(
                        MessageTag::Error.code(),
                        text.len(),
                    )?);
                }
                out.extend_from_slice(text.as_bytes());
            }
            WireMessage::Protocol(bytes) => {
                if self.multiplexing {
                    out.extend_from_slice(&encode_frame_header(MessageTag::Data.code(), bytes.len())?);
                }
                out.extend_from_slice(bytes);
            }
            WireMessage::Error { code, text } => {
                if self.multiplexing {
                    out.extend_from_slice(&encode_frame_header(*code, text.len() + 1)?);
                } else {
                    out.extend_from_slice(b"@ERROR: ");
                }
                out.extend_from_slice(text.as_bytes());
                out.push(b'\n');
            }
            other => return Err(ProtocolError::Unencodable(other.kind())),
        }
        Ok(())
    }
}

/// Inbound pipeline composing the demultiplexer ahead of the codec.
///
/// Raw socket bytes go through [`receive`](Self::receive). Until the
/// argument list terminates the bytes reach the codec directly; afterwards
/// they pass through the owned [`MultiplexDecoder`] and only the data-tag
/// payloads continue inward. Any bytes the codec had buffered when it
/// requested the switch are replayed through the decoder, so the framing
/// change is independent of how the peer packetized its writes.
#[derive(Debug, Default)]
pub struct SessionPipeline {
    codec: SessionCodec,
    decoder: MultiplexDecoder,
    demultiplexing: bool,
}

impl SessionPipeline {
    /// Creates the pipeline for a fresh connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable access to the session codec.
    #[must_use]
    pub const fn codec(&self) -> &SessionCodec {
        &self.codec
    }

    /// Mutable access to the session codec (encode path, outbound queue).
    pub fn codec_mut(&mut self) -> &mut SessionCodec {
        &mut self.codec
    }

    /// Feeds raw socket bytes through the current inbound stage chain.
    ///
    /// # Errors
    ///
    /// Propagates fatal codec and demultiplexer errors; the caller drops
    /// the connection.
    pub fn receive(&mut self, bytes: &[u8], out: &mut Vec<WireMessage>) -> Result<(), ProtocolError> {
        if self.demultiplexing {
            self.decoder.feed(bytes);
        } else {
            self.codec.feed(bytes, out)?;
            if !self.codec.take_multiplex_request() {
                return Ok(());
            }
            // The list terminator and the first frames may share a packet;
            // replay the unparsed residue through the decoder.
            self.demultiplexing = true;
            let residue = self.codec.drain_unparsed();
            debug!(residue = residue.len(), "inbound demultiplexer engaged");
            self.decoder.feed(&residue);
        }
        while let Some(payload) = self.decoder.next_payload()? {
            self.codec.feed(&payload, out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(codec: &mut SessionCodec, bytes: &[u8]) -> Vec<WireMessage> {
        let mut out = Vec::new();
        codec.feed(bytes, &mut out).expect("decode succeeds");
        out
    }

    fn codec_in_arguments() -> SessionCodec {
        let mut codec = SessionCodec::new();
        fed(&mut codec, b"@RSYNCD: 30.0\n");
        fed(&mut codec, b"module\n");
        assert_eq!(codec.state(), SessionState::Arguments);
        codec
    }

    #[test]
    fn handshake_advances_to_command() {
        let mut codec = SessionCodec::new();
        let out = fed(&mut codec, b"@RSYNCD: 30.0\n");
        assert_eq!(out, vec![WireMessage::Handshake { major: 30, minor: 0 }]);
        assert_eq!(codec.state(), SessionState::Command);
        assert!(!codec.is_closed());
    }

    #[test]
    fn handshake_overflow_refuses_and_closes() {
        let mut codec = SessionCodec::new();
        let out = fed(&mut codec, b"@RSYNCD: 30.00000\n");
        assert!(out.is_empty());
        assert!(codec.is_closed());
        assert_eq!(codec.take_outbound(), b"@ERROR: protocol startup error\n");
    }

    #[test]
    fn incompatible_version_reports_a_diagnostic() {
        let mut codec = SessionCodec::new();
        fed(&mut codec, b"@RSYNCD: 12.0\n");
        assert!(codec.is_closed());
        assert_eq!(
            codec.take_outbound(),
            b"@ERROR: protocol version 12.0 is not supported\n"
        );
    }

    #[test]
    fn post_close_arrivals_are_ignored() {
        let mut codec = SessionCodec::new();
        fed(&mut codec, b"@RSYNCD: 12.0\n");
        assert!(codec.is_closed());
        assert!(fed(&mut codec, b"module\n").is_empty());
    }

    #[test]
    fn command_line_is_passed_through() {
        let mut codec = SessionCodec::new();
        fed(&mut codec, b"@RSYNCD: 30.0\n");
        let out = fed(&mut codec, b"repo\n");
        assert_eq!(out, vec![WireMessage::Command("repo".into())]);
        assert_eq!(codec.state(), SessionState::Arguments);
    }

    #[test]
    fn arguments_engage_outbound_multiplexing_immediately() {
        let mut codec = codec_in_arguments();
        assert!(!codec.is_multiplexing());
        fed(&mut codec, b"--server\0");
        assert!(codec.is_multiplexing());
        assert!(!codec.take_multiplex_request(), "inbound switch waits for the terminator");
    }

    #[test]
    fn empty_argument_terminates_the_list() {
        let mut codec = codec_in_arguments();
        let out = fed(&mut codec, b"--server\0--sender\0-l\0\0");
        assert_eq!(
            out,
            vec![WireMessage::Arguments(vec![
                "--server".into(),
                "--sender".into(),
                "-l".into(),
            ])]
        );
        assert_eq!(codec.state(), SessionState::FilterList);
        assert!(codec.take_multiplex_request());
    }

    #[test]
    fn twenty_arguments_pass_and_the_twenty_first_refuses() {
        let mut codec = codec_in_arguments();
        for n in 0..MAX_ARGUMENTS {
            fed(&mut codec, format!("--opt{n}\0").as_bytes());
            assert!(!codec.is_closed(), "argument {n} must be accepted");
        }
        fed(&mut codec, b"--straw\0");
        assert!(codec.is_closed());
        assert_eq!(codec.take_outbound(), b"@ERROR: argument list too long\n");
    }

    #[test]
    fn oversized_argument_refuses() {
        let mut codec = codec_in_arguments();
        let long = vec![b'a'; ARGUMENT_CAP];
        fed(&mut codec, &long);
        assert!(codec.is_closed());
        assert_eq!(codec.take_outbound(), b"@ERROR: argument too long\n");
    }

    #[test]
    fn zero_filter_length_completes_the_phase() {
        let mut codec = codec_in_arguments();
        fed(&mut codec, b"\0");
        let out = fed(&mut codec, &[0, 0, 0, 0]);
        assert_eq!(out, vec![WireMessage::Filters(Vec::new())]);
        assert_eq!(codec.state(), SessionState::SendFiles);
    }

    #[test]
    fn partial_filter_payload_does_not_advance() {
        let mut codec = codec_in_arguments();
        fed(&mut codec, b"\0");
        // Length 4 with only 3 payload bytes buffered.
        let out = fed(&mut codec, &[4, 0, 0, 0, b'a', b'b', b'c']);
        assert!(out.is_empty());
        assert_eq!(codec.state(), SessionState::FilterList);
        let out = fed(&mut codec, b"d");
        assert!(out.is_empty(), "filters accumulate until the zero terminator");
        let out = fed(&mut codec, &[0, 0, 0, 0]);
        assert_eq!(out, vec![WireMessage::Filters(vec!["abcd".into()])]);
    }

    #[test]
    fn done_index_emits_list_done() {
        let mut codec = codec_in_arguments();
        fed(&mut codec, b"\0");
        fed(&mut codec, &[0, 0, 0, 0]);
        let out = fed(&mut codec, &[0x00]);
        assert_eq!(out, vec![WireMessage::ListDone]);
    }

    #[test]
    fn generator_request_spans_feeds() {
        let mut codec = codec_in_arguments();
        fed(&mut codec, b"\0");
        fed(&mut codec, &[0, 0, 0, 0]);

        // Index 0 as a delta byte, then the sum head in two pieces.
        assert!(fed(&mut codec, &[0x01, 1, 0, 0, 0]).is_empty());
        let mut tail = vec![0u8; 12];
        tail[0] = 4;
        let out = fed(&mut codec, &tail);
        assert_eq!(out.len(), 1);
        let WireMessage::Generator(request) = &out[0] else {
            panic!("expected a generator request, got {:?}", out[0]);
        };
        assert_eq!(request.index(), 0);
        assert!(request.is_complete());
    }

    #[test]
    fn negative_index_is_fatal_without_a_peer_message() {
        let mut codec = codec_in_arguments();
        fed(&mut codec, b"\0");
        fed(&mut codec, &[0, 0, 0, 0]);
        let mut out = Vec::new();
        let err = codec
            .feed(&[0xFE, 0xFE, 0xFF, 0xFF, 0xFF], &mut out)
            .unwrap_err();
        assert_eq!(err, ProtocolError::IndexProtocol(-2));
        assert!(codec.take_outbound().is_empty());
    }

    #[test]
    fn handshake_encodes_unmuxed() {
        let mut codec = SessionCodec::new();
        let mut out = Vec::new();
        codec
            .write(&WireMessage::Handshake { major: 30, minor: 0 }, &mut out)
            .unwrap();
        assert_eq!(out, b"@RSYNCD: 30.0\n");
    }

    #[test]
    fn setup_encodes_flags_then_le_seed() {
        let mut codec = SessionCodec::new();
        let mut out = Vec::new();
        codec
            .write(&WireMessage::Setup { flags: 0x04, seed: 0x0102_0304 }, &mut out)
            .unwrap();
        assert_eq!(out, [0x04, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn error_encoding_follows_the_multiplex_flag() {
        let mut codec = SessionCodec::new();
        let message = WireMessage::Error { code: 3, text: "no such module".into() };

        let mut plain = Vec::new();
        codec.write(&message, &mut plain).unwrap();
        assert_eq!(plain, b"@ERROR: no such module\n");

        fed(&mut codec, b"@RSYNCD: 30.0\nmod\n\0");
        assert!(codec.is_multiplexing());
        let mut muxed = Vec::new();
        codec.write(&message, &mut muxed).unwrap();
        let header = u32::from_le_bytes([muxed[0], muxed[1], muxed[2], muxed[3]]);
        assert_eq!(header, 15 | (10 << 24));
        assert_eq!(&muxed[4..], b"no such module\n");
    }

    #[test]
    fn protocol_payload_is_framed_when_multiplexing() {
        let mut codec = SessionCodec::new();
        fed(&mut codec, b"@RSYNCD: 30.0\nmod\n\0");
        let mut out = Vec::new();
        codec
            .write(&WireMessage::Protocol(vec![0xAA, 0xBB]), &mut out)
            .unwrap();
        let header = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(header >> 24, 7, "data frames carry tag 0 plus the base");
        assert_eq!(header & 0x00FF_FFFF, 2);
        assert_eq!(&out[4..], [0xAA, 0xBB]);
    }

    #[test]
    fn inbound_only_messages_are_unencodable() {
        let mut codec = SessionCodec::new();
        let mut out = Vec::new();
        let err = codec
            .write(&WireMessage::Command("mod".into()), &mut out)
            .unwrap_err();
        assert_eq!(err, ProtocolError::Unencodable("command"));
        assert!(out.is_empty());
    }
}
