//! Message framing layer
//!
//! Decodes the server's stdout into `Message`s and encodes outgoing ones.
//!
//! Two inbound wire formats are accepted, chosen per frame:
//!
//! ```text
//! Content-Length: <n>\r\n          (other headers are ignored)
//! \r\n
//! <n bytes of UTF-8 JSON>
//! ```
//!
//! or one JSON document per line when the frame does not start with the
//! `Content-Length` sentinel. Outbound messages always use the header form.

use bytes::{Buf, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::error::DecodeError;
use crate::rpc::message::Message;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Header blocks larger than this are treated as garbage
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Token that switches a frame into length-prefixed mode
const CONTENT_LENGTH_SENTINEL: &[u8] = b"Content-Length";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// At a frame boundary, format not known yet
    Detect,
    /// Inside a header block, waiting for the blank line
    Headers,
    /// Waiting for this many body bytes
    Body(usize),
    /// Skipping the remainder of an oversized body
    Discard(usize),
}

/// Result of comparing the buffer head against the sentinel
enum SentinelMatch {
    Full,
    Partial,
    No,
}

/// Codec for the server's stdio byte streams
#[derive(Debug)]
pub struct FrameCodec {
    state: DecodeState,
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            state: DecodeState::Detect,
            max_message_size,
        }
    }

    fn match_sentinel(src: &[u8]) -> SentinelMatch {
        let n = src.len().min(CONTENT_LENGTH_SENTINEL.len());
        if !src[..n].eq_ignore_ascii_case(&CONTENT_LENGTH_SENTINEL[..n]) {
            SentinelMatch::No
        } else if n == CONTENT_LENGTH_SENTINEL.len() {
            SentinelMatch::Full
        } else {
            SentinelMatch::Partial
        }
    }

    /// Locate the blank line ending a header block
    ///
    /// Returns the header length and the separator length.
    fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
        let crlf = src.windows(4).position(|w| w == b"\r\n\r\n");
        let lf = src.windows(2).position(|w| w == b"\n\n");
        match (crlf, lf) {
            (Some(c), Some(l)) if l < c => Some((l, 2)),
            (Some(c), _) => Some((c, 4)),
            (None, Some(l)) => Some((l, 2)),
            (None, None) => None,
        }
    }

    /// Parse Content-Length from a header block
    fn parse_content_length(header: &[u8]) -> Result<usize, DecodeError> {
        let header = std::str::from_utf8(header).map_err(|_| DecodeError::InvalidHeaderEncoding)?;

        for line in header.lines() {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value.trim();
                return value
                    .parse::<usize>()
                    .map_err(|_| DecodeError::InvalidContentLength(value.to_string()));
            }
        }

        Err(DecodeError::MissingContentLength)
    }

    /// Decode one newline-delimited document
    ///
    /// Lines that are blank or not valid JSON are dropped without error.
    fn decode_line(line: &[u8]) -> Option<Message> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_slice::<Message>(line) {
            Ok(message) => Some(message),
            Err(e) => {
                trace!(
                    "FrameCodec: Skipping undecodable line ({} bytes): {}",
                    line.len(),
                    e
                );
                None
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        loop {
            match self.state {
                DecodeState::Detect => match Self::match_sentinel(src) {
                    SentinelMatch::Full => self.state = DecodeState::Headers,
                    SentinelMatch::Partial => return Ok(None),
                    SentinelMatch::No => {
                        let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                            return Ok(None);
                        };
                        let line = src.split_to(newline + 1);
                        if let Some(message) = Self::decode_line(&line) {
                            return Ok(Some(message));
                        }
                    }
                },
                DecodeState::Headers => {
                    let Some((header_len, separator_len)) = Self::find_header_end(src) else {
                        if src.len() > MAX_HEADER_SIZE {
                            warn!(
                                "FrameCodec: Dropping {} bytes of unterminated headers",
                                src.len()
                            );
                            src.clear();
                            self.state = DecodeState::Detect;
                        }
                        return Ok(None);
                    };

                    let header = src.split_to(header_len + separator_len);
                    match Self::parse_content_length(&header[..header_len]) {
                        Ok(length) if length > self.max_message_size => {
                            warn!(
                                "FrameCodec: Dropping frame: {}",
                                DecodeError::MessageTooLarge {
                                    size: length,
                                    max: self.max_message_size,
                                }
                            );
                            self.state = DecodeState::Discard(length);
                        }
                        Ok(length) => {
                            trace!("FrameCodec: Content-Length {}", length);
                            self.state = DecodeState::Body(length);
                        }
                        Err(e) => {
                            warn!("FrameCodec: Dropping frame: {}", e);
                            self.state = DecodeState::Detect;
                        }
                    }
                }
                DecodeState::Body(length) => {
                    if src.len() < length {
                        trace!(
                            "FrameCodec: Incomplete body - need {} more bytes",
                            length - src.len()
                        );
                        src.reserve(length - src.len());
                        return Ok(None);
                    }

                    let body = src.split_to(length);
                    self.state = DecodeState::Detect;
                    match serde_json::from_slice::<Message>(&body) {
                        Ok(message) => {
                            trace!("FrameCodec: Parsed complete message ({} bytes)", length);
                            return Ok(Some(message));
                        }
                        Err(e) => warn!("FrameCodec: Dropping frame: {}", DecodeError::from(e)),
                    }
                }
                DecodeState::Discard(remaining) => {
                    let skipped = remaining.min(src.len());
                    src.advance(skipped);
                    if skipped < remaining {
                        self.state = DecodeState::Discard(remaining - skipped);
                        return Ok(None);
                    }
                    self.state = DecodeState::Detect;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        if !src.is_empty() {
            warn!(
                "FrameCodec: {}",
                DecodeError::Truncated { pending: src.len() }
            );
            src.clear();
        }
        self.state = DecodeState::Detect;
        Ok(None)
    }
}

impl Encoder<&Message> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(message).map_err(io::Error::other)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        dst.reserve(header.len() + body.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    /// Feed `chunks` one at a time, collecting every decoded message
    fn decode_chunks<'a>(
        codec: &mut FrameCodec,
        chunks: impl IntoIterator<Item = &'a [u8]>,
    ) -> Vec<Message> {
        let mut buffer = BytesMut::new();
        let mut decoded = Vec::new();
        for chunk in chunks {
            buffer.extend_from_slice(chunk);
            while let Some(message) = codec.decode(&mut buffer).unwrap() {
                decoded.push(message);
            }
        }
        decoded
    }

    fn decode_all(bytes: &[u8]) -> Vec<Message> {
        decode_chunks(&mut FrameCodec::new(), [bytes])
    }

    #[test]
    fn test_decode_single_frame() {
        let body = r#"{"jsonrpc":"2.0","id":1,"result":{"pong":true}}"#;
        let decoded = decode_all(&frame(body));

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].numeric_id(), Some(1));
        assert_eq!(decoded[0].result, Some(json!({"pong": true})));
    }

    #[test]
    fn test_frame_reassembly_any_split() {
        let body = r#"{"jsonrpc":"2.0","id":42,"result":{"tools":[{"name":"echo"}]}}"#;
        let bytes = frame(body);
        let expected = decode_all(&bytes);
        assert_eq!(expected.len(), 1);

        // Two chunks, split at every position
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            let decoded = decode_chunks(&mut FrameCodec::new(), [a, b]);
            assert_eq!(decoded, expected, "split at {split}");
        }

        // Three chunks
        for first in 0..bytes.len() {
            for second in first..bytes.len() {
                let chunks = [&bytes[..first], &bytes[first..second], &bytes[second..]];
                let decoded = decode_chunks(&mut FrameCodec::new(), chunks);
                assert_eq!(decoded, expected, "splits at {first}/{second}");
            }
        }

        // One byte at a time
        let decoded = decode_chunks(&mut FrameCodec::new(), bytes.chunks(1));
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_newline_delimited_fallback() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"result":{}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"p":1}}"#,
            "\r\n",
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-1,"message":"x"}}"#,
            "\n"
        );
        let decoded = decode_all(input.as_bytes());

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].numeric_id(), Some(1));
        assert_eq!(decoded[1].method.as_deref(), Some("notifications/progress"));
        assert_eq!(decoded[2].numeric_id(), Some(2));
    }

    #[test]
    fn test_newline_partial_line_is_buffered() {
        let line = r#"{"jsonrpc":"2.0","id":5,"result":"ok"}"#;
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&line.as_bytes()[..10]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&line.as_bytes()[10..]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"\n");
        let message = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(message.numeric_id(), Some(5));
    }

    #[test]
    fn test_undecodable_line_is_dropped() {
        let input = concat!(
            "server starting up...\n",
            "{\"broken\": \n",
            "\n",
            r#"{"jsonrpc":"2.0","id":3,"result":null}"#,
            "\n"
        );
        let decoded = decode_all(input.as_bytes());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].numeric_id(), Some(3));
    }

    #[test]
    fn test_mixed_formats_in_one_stream() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"{\"id\":1,\"result\":1}\n");
        bytes.extend_from_slice(&frame(r#"{"id":2,"result":2}"#));
        // Some servers terminate framed bodies with a newline
        bytes.extend_from_slice(b"\n");
        bytes.extend_from_slice(&frame(r#"{"id":3,"result":3}"#));
        bytes.extend_from_slice(b"{\"id\":4,\"result\":4}\n");

        let ids: Vec<_> = decode_all(&bytes)
            .iter()
            .filter_map(Message::numeric_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_extra_headers_and_separators() {
        let body = r#"{"id":9,"result":{}}"#;
        let with_type = format!(
            "Content-Length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let lower_lf = format!("content-length: {}\n\n{}", body.len(), body);

        for input in [with_type, lower_lf] {
            let decoded = decode_all(input.as_bytes());
            assert_eq!(decoded.len(), 1, "input: {input:?}");
            assert_eq!(decoded[0].numeric_id(), Some(9));
        }
    }

    #[test]
    fn test_invalid_content_length_recovers() {
        let mut bytes = b"Content-Length: abc\r\n\r\n".to_vec();
        bytes.extend_from_slice(&frame(r#"{"id":1,"result":true}"#));

        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].result, Some(json!(true)));
    }

    #[test]
    fn test_invalid_body_dropped() {
        let mut bytes = frame("{not json}");
        bytes.extend_from_slice(&frame("[1,2]"));
        bytes.extend_from_slice(&frame(r#"{"id":2,"result":"kept"}"#));

        let decoded = decode_all(&bytes);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].result, Some(json!("kept")));
    }

    #[test]
    fn test_oversized_frame_discarded() {
        let big = format!(r#"{{"id":1,"result":"{}"}}"#, "x".repeat(200));
        let mut bytes = frame(&big);
        bytes.extend_from_slice(&frame(r#"{"id":2,"result":"small"}"#));

        let mut codec = FrameCodec::with_max_message_size(64);
        let decoded = decode_chunks(&mut codec, bytes.chunks(7));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].numeric_id(), Some(2));
    }

    #[test]
    fn test_short_body_stalls_only_that_frame() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&frame(r#"{"id":1,"result":1}"#)[..]);
        buffer.extend_from_slice(b"Content-Length: 100\r\n\r\n{\"id\":2");

        assert_eq!(codec.decode(&mut buffer).unwrap().unwrap().numeric_id(), Some(1));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(codec.state, DecodeState::Body(100));
    }

    #[test]
    fn test_decode_eof_drops_truncated_frame() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from("Content-Length: 50\r\n\r\n{\"id\":");

        assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
        assert!(buffer.is_empty());
        assert_eq!(codec.state, DecodeState::Detect);
    }

    #[test]
    fn test_decode_eof_flushes_complete_frames() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&frame(r#"{"id":1,"result":1}"#)[..]);

        assert!(codec.decode_eof(&mut buffer).unwrap().is_some());
        assert!(codec.decode_eof(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_encode_counts_utf8_bytes() {
        let message = Message::request(1, "tools/call", Some(json!({"text": "héllo 世界"})));
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(&message, &mut dst).unwrap();

        let body = serde_json::to_vec(&message).unwrap();
        let expected_header = format!("Content-Length: {}\r\n\r\n", body.len());
        assert!(body.len() > serde_json::to_string(&message).unwrap().chars().count());
        assert_eq!(&dst[..expected_header.len()], expected_header.as_bytes());
        assert_eq!(&dst[expected_header.len()..], &body[..]);

        // And it decodes back through the length-prefixed path
        let decoded = decode_all(&dst);
        assert_eq!(decoded, vec![message]);
    }
}
