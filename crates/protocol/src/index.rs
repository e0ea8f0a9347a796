//! Variable-length file-list index codec.
//!
//! Generator requests name files by their position in the transmitted file
//! list. Indices travel in a byte-reduced encoding: a single delta byte for
//! the common in-order case, a 3-byte short form (`0xFF` plus a
//! little-endian `u16`) for small absolute values, and a 5-byte long form
//! (`0xFE` plus a little-endian `i32`) for everything else. The lone zero
//! byte is the [`NDX_DONE`] sentinel closing the request list.

use crate::error::ProtocolError;
use crate::framing::ByteWindow;

/// Sentinel index closing the generator's request list.
pub const NDX_DONE: i32 = -1;

const SHORT_FORM: u8 = 0xFF;
const LONG_FORM: u8 = 0xFE;

/// Incremental reader for the index encoding.
///
/// The reader is restartable: when the buffered bytes do not complete an
/// encoding it consumes nothing and reports that more data is needed, so a
/// request split across packets decodes exactly like one that arrived
/// whole. The previously-emitted index seeds the delta form and starts
/// at −1.
#[derive(Debug)]
pub struct IndexReader {
    previous: i32,
}

impl Default for IndexReader {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexReader {
    /// Creates a reader with the initial previous-index state.
    #[must_use]
    pub const fn new() -> Self {
        Self { previous: -1 }
    }

    /// Decodes the next index, or `Ok(None)` when the encoding is still
    /// incomplete.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::IndexProtocol`] when the decoded value is negative
    /// and not the [`NDX_DONE`] sentinel.
    pub fn read(&mut self, window: &mut ByteWindow) -> Result<Option<i32>, ProtocolError> {
        let slice = window.as_slice();
        let Some(&lead) = slice.first() else {
            return Ok(None);
        };
        let (value, consumed) = match lead {
            0x00 => (NDX_DONE, 1),
            SHORT_FORM => {
                if slice.len() < 3 {
                    return Ok(None);
                }
                (i32::from(u16::from_le_bytes([slice[1], slice[2]])), 3)
            }
            LONG_FORM => {
                if slice.len() < 5 {
                    return Ok(None);
                }
                (
                    i32::from_le_bytes([slice[1], slice[2], slice[3], slice[4]]),
                    5,
                )
            }
            delta => (self.previous.wrapping_add(i32::from(delta)), 1),
        };
        // Only the lone zero byte encodes the sentinel; any other form
        // decoding negative is a corrupt stream.
        if lead != 0x00 && value < 0 {
            return Err(ProtocolError::IndexProtocol(value));
        }
        window.advance(consumed);
        // The sentinel leaves the delta base untouched.
        if value != NDX_DONE {
            self.previous = value;
        }
        Ok(Some(value))
    }
}

/// Streaming writer producing the exact inverse of [`IndexReader`].
#[derive(Debug)]
pub struct IndexWriter {
    previous: i32,
}

impl Default for IndexWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexWriter {
    /// Creates a writer with the initial previous-index state.
    #[must_use]
    pub const fn new() -> Self {
        Self { previous: -1 }
    }

    /// Appends the encoding of `ndx` to `out`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::IndexProtocol`] for negative values other than
    /// [`NDX_DONE`].
    pub fn write(&mut self, ndx: i32, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if ndx == NDX_DONE {
            out.push(0x00);
            return Ok(());
        }
        if ndx < 0 {
            return Err(ProtocolError::IndexProtocol(ndx));
        }
        let diff = i64::from(ndx) - i64::from(self.previous);
        if (1..i64::from(LONG_FORM)).contains(&diff) {
            out.push(diff as u8);
        } else if let Ok(small) = u16::try_from(ndx) {
            out.push(SHORT_FORM);
            out.extend_from_slice(&small.to_le_bytes());
        } else {
            out.push(LONG_FORM);
            out.extend_from_slice(&ndx.to_le_bytes());
        }
        self.previous = ndx;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(bytes: &[u8]) -> Vec<i32> {
        let mut window = ByteWindow::new();
        window.extend(bytes);
        let mut reader = IndexReader::new();
        let mut values = Vec::new();
        while let Some(value) = reader.read(&mut window).unwrap() {
            values.push(value);
            if window.remaining() == 0 {
                break;
            }
        }
        values
    }

    #[test]
    fn zero_byte_is_the_done_sentinel() {
        assert_eq!(read_all(&[0x00]), vec![NDX_DONE]);
    }

    #[test]
    fn delta_byte_extends_the_previous_index() {
        // Starting from -1, deltas 1 and 1 walk the list in order.
        assert_eq!(read_all(&[0x01, 0x01]), vec![0, 1]);
    }

    #[test]
    fn short_form_is_absolute() {
        assert_eq!(read_all(&[SHORT_FORM, 0x00, 0x80]), vec![32768]);
    }

    #[test]
    fn long_form_is_absolute() {
        assert_eq!(read_all(&[LONG_FORM, 0xFF, 0xFF, 0xFF, 0x7F]), vec![i32::MAX]);
    }

    #[test]
    fn short_form_reseeds_the_delta_base() {
        assert_eq!(read_all(&[SHORT_FORM, 0xE8, 0x03, 0x05]), vec![1000, 1005]);
    }

    #[test]
    fn done_does_not_disturb_the_delta_base() {
        assert_eq!(read_all(&[0x01, 0x00, 0x01]), vec![0, NDX_DONE, 1]);
    }

    #[test]
    fn incomplete_forms_consume_nothing() {
        let mut window = ByteWindow::new();
        let mut reader = IndexReader::new();

        window.extend(&[SHORT_FORM, 0x01]);
        assert_eq!(reader.read(&mut window).unwrap(), None);
        assert_eq!(window.remaining(), 2);

        window.drain_all();
        window.extend(&[LONG_FORM, 0x01, 0x02, 0x03]);
        assert_eq!(reader.read(&mut window).unwrap(), None);
        assert_eq!(window.remaining(), 4);
    }

    #[test]
    fn negative_long_form_is_a_protocol_error() {
        let mut window = ByteWindow::new();
        window.extend(&[LONG_FORM, 0xFF, 0xFF, 0xFF, 0xFF]);
        let err = IndexReader::new().read(&mut window).unwrap_err();
        assert_eq!(err, ProtocolError::IndexProtocol(-1));
    }

    #[test]
    fn writer_rejects_negative_non_sentinel() {
        let mut out = Vec::new();
        let err = IndexWriter::new().write(-2, &mut out).unwrap_err();
        assert_eq!(err, ProtocolError::IndexProtocol(-2));
    }

    #[test]
    fn writer_emits_single_byte_deltas_for_ordered_walks() {
        let mut writer = IndexWriter::new();
        let mut out = Vec::new();
        for ndx in 0..5 {
            writer.write(ndx, &mut out).unwrap();
        }
        assert_eq!(out, [0x01; 5]);
    }

    #[test]
    fn reader_inverts_writer() {
        let values = [
            NDX_DONE,
            0,
            1,
            126,
            127,
            128,
            32767,
            32768,
            i32::MAX,
        ];
        let mut writer = IndexWriter::new();
        let mut encoded = Vec::new();
        for &ndx in &values {
            writer.write(ndx, &mut encoded).unwrap();
        }

        let mut window = ByteWindow::new();
        window.extend(&encoded);
        let mut reader = IndexReader::new();
        for &expected in &values {
            assert_eq!(reader.read(&mut window).unwrap(), Some(expected));
        }
        assert_eq!(window.remaining(), 0);
    }
}
