//! [`RecordCodec`] – splits the device byte stream into scan records.
//!
//! Each record ends at a single delimiter byte (`\r` for the stock scanner).
//! The bytes before the delimiter are decoded as UTF-8 and trimmed of
//! surrounding whitespace, so a `\r\n` terminator yields the same record as a
//! bare `\r`. Empty records are passed through; deciding whether to keep them
//! is the consumer's business.
//!
//! Records that cannot be decoded, or that exceed the configured maximum
//! length, come out as [`Frame::Malformed`] instead of an error so a single
//! bad scan never tears the link down.

use std::cmp;
use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Why a record was rejected at the framing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedRecord {
    InvalidUtf8,
    TooLong,
}

/// One unit produced by [`RecordCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Record(String),
    Malformed(MalformedRecord),
}

/// Delimiter-framed record decoder.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    delimiter: u8,
    max_length: usize,
    /// Where the next delimiter search starts, so partial reads are not
    /// rescanned.
    next_index: usize,
    /// Set while skipping the remainder of an oversized record.
    discarding: bool,
}

impl RecordCodec {
    pub fn new(delimiter: u8, max_length: usize) -> Self {
        Self {
            delimiter,
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }
}

fn decode_record(body: &[u8]) -> Frame {
    match std::str::from_utf8(body) {
        Ok(text) => Frame::Record(text.trim().to_string()),
        Err(_) => Frame::Malformed(MalformedRecord::InvalidUtf8),
    }
}

impl Decoder for RecordCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        loop {
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let offset = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == self.delimiter)
                .map(|o| o + self.next_index);

            match (self.discarding, offset) {
                (true, Some(idx)) => {
                    buf.advance(idx + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    return Ok(Some(Frame::Malformed(MalformedRecord::TooLong)));
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(idx)) => {
                    self.next_index = 0;
                    let record = buf.split_to(idx + 1);
                    return Ok(Some(decode_record(&record[..idx])));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        self.next_index = 0;
        if buf.is_empty() {
            return Ok(None);
        }
        if self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(Some(Frame::Malformed(MalformedRecord::TooLong)));
        }
        let rest = buf.split_to(buf.len());
        Ok(Some(decode_record(&rest)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(codec: &mut RecordCodec, buf: &mut BytesMut) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            out.push(frame);
        }
        out
    }

    fn record(s: &str) -> Frame {
        Frame::Record(s.to_string())
    }

    #[test]
    fn splits_on_carriage_return_and_trims() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"A1\r  B2 \r"[..]);
        assert_eq!(drain(&mut codec, &mut buf), vec![record("A1"), record("B2")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn crlf_terminator_leaves_no_stray_newline() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"A1\r\nB2\r\n"[..]);
        let frames = drain(&mut codec, &mut buf);
        assert_eq!(frames, vec![record("A1"), record("B2")]);
    }

    #[test]
    fn empty_records_are_passed_through() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"A1\r\r   \rB2\r"[..]);
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![record("A1"), record(""), record(""), record("B2")]
        );
    }

    #[test]
    fn partial_record_waits_for_more_bytes() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"52-H10"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"24\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(record("52-H1024")));
    }

    #[test]
    fn invalid_utf8_is_malformed_and_stream_continues() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"\xff\xfe\rOK\r"[..]);
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![Frame::Malformed(MalformedRecord::InvalidUtf8), record("OK")]
        );
    }

    #[test]
    fn oversized_record_is_discarded_up_to_delimiter() {
        let mut codec = RecordCodec::new(b'\r', 4);
        let mut buf = BytesMut::from(&b"TOOLONGRECORD"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"XYZ\rA1\r");
        assert_eq!(
            drain(&mut codec, &mut buf),
            vec![Frame::Malformed(MalformedRecord::TooLong), record("A1")]
        );
    }

    #[test]
    fn eof_flushes_trailing_partial_record() {
        let mut codec = RecordCodec::new(b'\r', 64);
        let mut buf = BytesMut::from(&b"A1\rB2"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(record("A1")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some(record("B2")));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
