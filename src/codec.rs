//! Frame codec for the device's JSON stream.
//!
//! Outbound requests are written as one JSON object per line. Inbound, the
//! device usually terminates objects with a newline but has been seen writing
//! them back to back, so the decoder splits on object boundaries within a
//! line. An object never spans a line break: a line that does not parse is
//! dropped whole and surfaced as [`Inbound::Malformed`] so the stream keeps
//! going.

use crate::error::BraviaError;
use crate::protocol::{Inbound, Request};
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single buffered frame
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Codec turning [`Request`]s into lines and bytes into [`Inbound`] frames
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

enum Step {
    Frame(Value, usize),
    Incomplete,
    Invalid(String),
}

impl FrameCodec {
    fn step(src: &[u8]) -> Step {
        let mut stream = serde_json::Deserializer::from_slice(src).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => Step::Frame(value, stream.byte_offset()),
            Some(Err(e)) if e.is_eof() => Step::Incomplete,
            Some(Err(e)) => Step::Invalid(e.to_string()),
            None => Step::Incomplete,
        }
    }

    /// Drop the line ending at `end` and describe why
    fn drop_line(src: &mut BytesMut, end: usize, reason: &str) -> Inbound {
        let line = src.split_to(end + 1);
        Inbound::Malformed(format!(
            "{} in {:?}",
            reason,
            String::from_utf8_lossy(&line).trim()
        ))
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = BraviaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, BraviaError> {
        let blank = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        src.advance(blank);
        if src.is_empty() {
            return Ok(None);
        }

        // A buffered newline bounds the frame: whatever precedes it must
        // parse on its own.
        if let Some(end) = src.iter().position(|b| *b == b'\n') {
            let frame = match Self::step(&src[..end]) {
                Step::Frame(value, consumed) => {
                    src.advance(consumed);
                    Inbound::classify(value)
                }
                Step::Incomplete => Self::drop_line(src, end, "unterminated object"),
                Step::Invalid(reason) => Self::drop_line(src, end, &reason),
            };
            return Ok(Some(frame));
        }

        match Self::step(src) {
            Step::Frame(value, consumed) => {
                src.advance(consumed);
                Ok(Some(Inbound::classify(value)))
            }
            _ if src.len() > MAX_FRAME_LEN => {
                let dropped = src.len();
                src.clear();
                Ok(Some(Inbound::Malformed(format!(
                    "discarded {} bytes without a complete frame",
                    dropped
                ))))
            }
            // Wait for the rest of the object or the newline ending a bad one
            _ => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, BraviaError> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(Inbound::Malformed(format!(
            "truncated frame {:?}",
            String::from_utf8_lossy(&rest)
        ))))
    }
}

impl Encoder<Request> for FrameCodec {
    type Error = BraviaError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), BraviaError> {
        let json = serde_json::to_vec(&item)?;
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
