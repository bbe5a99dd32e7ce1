//! Line framing for IRC streams.
//!
//! Decodes CRLF (or bare LF) separated lines into [`Message`]s. A line that
//! fails to parse is surfaced as [`Frame::Invalid`] rather than an error so
//! the connection stays up; the byte count is preserved either way for the
//! connection's data-rate accounting.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Message, MAX_LINE_LEN};

/// One decoded frame: a parsed message or a malformed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { msg: Message, bytes: usize },
    Invalid { bytes: usize },
}

impl Frame {
    pub fn bytes(&self) -> usize {
        match self {
            Frame::Message { bytes, .. } | Frame::Invalid { bytes } => *bytes,
        }
    }
}

/// Codec for `\r\n`-separated IRC lines.
#[derive(Debug, Default)]
pub struct LineCodec;

// Hard cap on buffered bytes before a newline shows up. Tags are exempt
// from the 512-byte message cap, so allow generous headroom.
const MAX_BUFFER: usize = 16 * 1024;

impl Decoder for LineCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, std::io::Error> {
        let Some(pos) = src.iter().position(|&b| b == b'\n') else {
            if src.len() > MAX_BUFFER {
                // Discard the runaway line; it will decode as invalid once
                // a newline finally arrives.
                let len = src.len();
                src.advance(len);
            }
            return Ok(None);
        };

        let line = src.split_to(pos + 1);
        let bytes = line.len();
        let text = match std::str::from_utf8(&line) {
            Ok(text) => text,
            Err(_) => return Ok(Some(Frame::Invalid { bytes })),
        };
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(Some(Frame::Invalid { bytes }));
        }
        match trimmed.parse::<Message>() {
            Ok(msg) => Ok(Some(Frame::Message { msg, bytes })),
            Err(_) => Ok(Some(Frame::Invalid { bytes })),
        }
    }
}

impl Encoder<&Message> for LineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, msg: &Message, dst: &mut BytesMut) -> Result<(), std::io::Error> {
        let mut line = msg.to_string();
        // Encoding is byte-transparent except that embedded newlines would
        // break framing; truncate at the first one.
        if let Some(pos) = line.find(['\r', '\n']) {
            line.truncate(pos);
        }
        if line.len() > MAX_LINE_LEN - 2 {
            let mut cut = MAX_LINE_LEN - 2;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &str) -> Vec<Frame> {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn decodes_crlf_lines() {
        let frames = decode_all("NICK alice\r\nUSER a 0 * :Alice\r\n");
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            Frame::Message { msg, bytes } => {
                assert_eq!(msg.command, "NICK");
                assert_eq!(*bytes, 12);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn bare_lf_accepted() {
        let frames = decode_all("PING x\n");
        assert!(matches!(&frames[0], Frame::Message { msg, .. } if msg.command == "PING"));
    }

    #[test]
    fn malformed_line_keeps_byte_count() {
        let frames = decode_all(":onlyprefix\r\n");
        assert_eq!(frames, vec![Frame::Invalid { bytes: 13 }]);
    }

    #[test]
    fn partial_line_waits_for_more() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::from("PRIVMSG #c :hel");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"lo\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Message { msg, .. } if msg.params[1] == "hello"));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        let msg = Message::new("PONG", vec!["irc.example.com".into()]);
        codec.encode(&msg, &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG irc.example.com\r\n");
    }

    #[test]
    fn encode_caps_line_length() {
        let mut codec = LineCodec;
        let mut buf = BytesMut::new();
        let msg = Message::new("PRIVMSG", vec!["#c".into(), "x".repeat(600)]);
        codec.encode(&msg, &mut buf).unwrap();
        assert!(buf.len() <= MAX_LINE_LEN);
        assert!(buf.ends_with(b"\r\n"));
    }
}
