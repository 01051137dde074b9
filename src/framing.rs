//! Delimiter framing for the text wire protocol.
//!
//! Every message on the wire is encoded text immediately followed by a fixed
//! delimiter. There is no length prefix and no checksum:
//!
//! ```text
//! hello<<EOF>>
//! ```
//!
//! A sender removes every literal occurrence of the delimiter from its payload
//! before appending one, so a message can never contain it. This is lossy:
//! `"a<<EOF>>b"` arrives as `"ab"`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::borrow::Cow;

/// Message terminator.
pub const DELIMITER: &[u8] = b"<<EOF>>";

/// [`DELIMITER`] as text, for stripping outgoing payloads.
pub const DELIMITER_STR: &str = "<<EOF>>";

/// Text encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
pub enum Encoding {
    /// UTF-8; invalid sequences decode to U+FFFD.
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    #[value(name = "utf-8", alias = "utf8")]
    Utf8,
    /// ISO-8859-1; characters above U+00FF encode as `?`.
    #[serde(rename = "latin-1", alias = "latin1")]
    #[value(name = "latin-1", alias = "latin1")]
    Latin1,
}

impl Encoding {
    /// Append the encoded form of `text` to `out`.
    pub fn encode_into(self, text: &str, out: &mut BytesMut) {
        match self {
            Encoding::Utf8 => out.put_slice(text.as_bytes()),
            Encoding::Latin1 => {
                out.reserve(text.len());
                for c in text.chars() {
                    let code = u32::from(c);
                    out.put_u8(if code <= 0xFF { code as u8 } else { b'?' });
                }
            }
        }
    }

    /// Decode received bytes into text.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Remove every occurrence of the delimiter from `payload`.
///
/// Stripping repeats until none is left, so a payload such as
/// `"<<E<<EOF>>OF>>"` cannot reassemble a delimiter.
pub fn strip_delimiter(payload: &str) -> Cow<'_, str> {
    if !payload.contains(DELIMITER_STR) {
        return Cow::Borrowed(payload);
    }

    let mut text = payload.replace(DELIMITER_STR, "");
    while text.contains(DELIMITER_STR) {
        text = text.replace(DELIMITER_STR, "");
    }
    Cow::Owned(text)
}

/// Build one wire frame: the stripped, encoded payload plus the delimiter.
pub fn encode_frame(payload: &str, encoding: Encoding) -> Bytes {
    let text = strip_delimiter(payload);
    let mut frame = BytesMut::with_capacity(text.len() + DELIMITER.len());
    encoding.encode_into(&text, &mut frame);
    frame.put_slice(DELIMITER);
    frame.freeze()
}

/// Framing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The buffered bytes exceed the configured maximum.
    #[error("receive buffer holds {buffered} bytes, limit is {limit}")]
    Overflow { buffered: usize, limit: usize },
}

/// Accumulates received bytes and splits them into delimiter-terminated frames.
///
/// Frames are found by the first delimiter occurrence, regardless of how the
/// bytes were split across reads. Bytes following a delimiter stay buffered
/// as the start of the next frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    /// Offset before which `buffer` cannot start a delimiter.
    cursor: usize,
    max_buffer: Option<usize>,
}

impl FrameDecoder {
    /// Create a decoder, optionally bounding the unframed bytes it holds.
    pub fn new(max_buffer: Option<usize>) -> Self {
        Self {
            buffer: BytesMut::new(),
            cursor: 0,
            max_buffer,
        }
    }

    /// Append received bytes.
    ///
    /// Fails once the accumulated buffer exceeds the maximum; the caller is
    /// expected to drop the connection at that point.
    pub fn push(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buffer.extend_from_slice(data);
        match self.max_buffer {
            Some(limit) if self.buffer.len() > limit => Err(FrameError::Overflow {
                buffered: self.buffer.len(),
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Extract the next complete frame, without its delimiter.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < DELIMITER.len() {
            return None;
        }

        match find_delimiter(&self.buffer[self.cursor..]) {
            Some(pos) => {
                let frame = self.buffer.split_to(self.cursor + pos).freeze();
                self.buffer.advance(DELIMITER.len());
                self.cursor = 0;
                Some(frame)
            }
            None => {
                self.cursor = self.buffer.len() + 1 - DELIMITER.len();
                None
            }
        }
    }

    /// Number of buffered bytes not yet framed.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Find the delimiter in `buffer`, returning the position of its first byte.
fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(DELIMITER.len())
        .position(|window| window == DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Bytes> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_single_frame() {
        let mut decoder = FrameDecoder::new(None);
        decoder.push(b"hello<<EOF>>").unwrap();
        assert_eq!(decoder.next_frame().unwrap(), &b"hello"[..]);
        assert!(decoder.next_frame().is_none());
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_every_split_point() {
        let wire = b"hello, world<<EOF>>";
        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new(None);
            decoder.push(&wire[..split]).unwrap();
            assert!(decoder.next_frame().is_none(), "early frame at split {split}");
            decoder.push(&wire[split..]).unwrap();
            assert_eq!(decoder.next_frame().unwrap(), &b"hello, world"[..]);
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = FrameDecoder::new(None);
        let mut frames = Vec::new();
        for byte in b"ab<<EOF>>cd<<EOF>>" {
            decoder.push(&[*byte]).unwrap();
            frames.extend(drain(&mut decoder));
        }
        assert_eq!(frames, vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
    }

    #[test]
    fn test_multiple_frames_keep_remainder() {
        let mut decoder = FrameDecoder::new(None);
        decoder.push(b"one<<EOF>>two<<EOF>>thr").unwrap();
        assert_eq!(
            drain(&mut decoder),
            vec![Bytes::from_static(b"one"), Bytes::from_static(b"two")]
        );
        assert_eq!(decoder.len(), 3);

        decoder.push(b"ee<<EOF>>").unwrap();
        assert_eq!(decoder.next_frame().unwrap(), &b"three"[..]);
    }

    #[test]
    fn test_empty_frame() {
        let mut decoder = FrameDecoder::new(None);
        decoder.push(b"<<EOF>>").unwrap();
        assert_eq!(decoder.next_frame().unwrap(), &b""[..]);
    }

    #[test]
    fn test_partial_delimiter_lookalike() {
        let mut decoder = FrameDecoder::new(None);
        decoder.push(b"a<<EO").unwrap();
        assert!(decoder.next_frame().is_none());
        decoder.push(b"X<<EOF>>").unwrap();
        assert_eq!(decoder.next_frame().unwrap(), &b"a<<EOX"[..]);
    }

    #[test]
    fn test_overflow() {
        let mut decoder = FrameDecoder::new(Some(8));
        decoder.push(b"12345678").unwrap();
        assert_eq!(
            decoder.push(b"9"),
            Err(FrameError::Overflow {
                buffered: 9,
                limit: 8
            })
        );
    }

    #[test]
    fn test_strip_delimiter() {
        assert_eq!(strip_delimiter("plain"), "plain");
        assert!(matches!(strip_delimiter("plain"), Cow::Borrowed(_)));
        assert_eq!(strip_delimiter("a<<EOF>>b<<EOF>>"), "ab");
        assert_eq!(strip_delimiter("<<E<<EOF>>OF>>x"), "x");
    }

    #[test]
    fn test_encode_frame() {
        assert_eq!(
            encode_frame("hi<<EOF>>there", Encoding::Utf8),
            &b"hithere<<EOF>>"[..]
        );
        assert_eq!(encode_frame("", Encoding::Utf8), DELIMITER);
    }

    #[test]
    fn test_latin1() {
        let frame = encode_frame("café Ā", Encoding::Latin1);
        assert_eq!(frame, &b"caf\xe9 ?<<EOF>>"[..]);
        assert_eq!(Encoding::Latin1.decode(b"caf\xe9"), "café");
    }

    #[test]
    fn test_utf8_lossy_decode() {
        assert_eq!(Encoding::Utf8.decode("héllo".as_bytes()), "héllo");
        assert_eq!(Encoding::Utf8.decode(b"a\xffb"), "a\u{fffd}b");
    }
}
