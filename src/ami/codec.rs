// src/ami/codec.rs
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::AmiError;

/// One protocol message as received off the wire: the `Key: Value` lines of
/// a frame, without the blank-line terminator. Produced by [`FrameCodec`],
/// consumed once by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    data: Bytes,
}

impl RawFrame {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Frame text. AMI is ASCII in practice; invalid UTF-8 is replaced
    /// rather than rejected so one bad frame cannot stall the stream.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Splits the inbound byte stream into blank-line-terminated frames.
///
/// TCP delivers arbitrary chunk boundaries, so the codec keeps everything in
/// one growable buffer and remembers how far the last scan got: each call
/// resumes just before the tail instead of re-scanning from the start, which
/// keeps the work O(n) amortized even when a terminator is split across
/// chunks. Lines end in CRLF per the protocol, but bare LF is tolerated
/// (seen from some switch builds).
#[derive(Debug, Default)]
pub struct FrameCodec {
    next_scan: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the end of a terminator starting at a `\n` located at `i`,
    /// i.e. `\n\r\n` or `\n\n`. Returns the index one past the terminator.
    fn terminator_end(src: &[u8], i: usize) -> Option<usize> {
        match src.get(i + 1) {
            Some(b'\n') => Some(i + 2),
            Some(b'\r') if src.get(i + 2) == Some(&b'\n') => Some(i + 3),
            _ => None,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = RawFrame;
    type Error = AmiError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, AmiError> {
        loop {
            let mut i = self.next_scan;
            let mut frame_end = None;
            while i < src.len() {
                if src[i] == b'\n' {
                    if let Some(end) = Self::terminator_end(src, i) {
                        frame_end = Some((i, end));
                        break;
                    }
                }
                i += 1;
            }

            let Some((newline_at, end)) = frame_end else {
                // No full terminator yet. Resume two bytes before the tail so
                // a terminator split across chunks is still caught.
                self.next_scan = src.len().saturating_sub(2);
                return Ok(None);
            };

            // Frame content ends at the newline that opened the terminator;
            // strip the \r of a CRLF last line.
            let mut content_len = newline_at;
            if content_len > 0 && src[content_len - 1] == b'\r' {
                content_len -= 1;
            }
            let frame = src.split_to(end).freeze().slice(0..content_len);
            self.next_scan = 0;

            if frame.is_empty() {
                // Stray blank line between frames; keep scanning.
                continue;
            }
            return Ok(Some(RawFrame::new(frame)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, AmiError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let tail = src.len();
                src.advance(tail);
                Err(AmiError::Protocol(format!(
                    "truncated stream: connection closed with {} unterminated bytes buffered",
                    tail
                )))
            }
        }
    }
}
