//! Chat message and line framing
//!
//! The wire carries raw bytes with no length prefix. A single transport read
//! may hold several lines or a fragment of one, so received bytes go through
//! a `LineDecoder` which yields one `Message` text per `\n`-terminated line.

use crate::types::SessionId;

/// Default upper bound on a single line before it is flushed unterminated
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// A line of chat text tagged with the session that sent it
///
/// Immutable once built; moves by value through the admission queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    text: String,
    sender: SessionId,
}

impl Message {
    /// Create a new message
    pub fn new(text: impl Into<String>, sender: SessionId) -> Self {
        Self {
            text: text.into(),
            sender,
        }
    }

    /// The message body, without line terminator
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The identity of the originating session
    pub fn sender(&self) -> SessionId {
        self.sender
    }
}

/// Encode a line for the wire: the text followed by exactly one `\n`
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Incremental newline-delimited decoder
///
/// Bytes are fed in arbitrary chunks. Complete lines are returned with the
/// `\n` (and a preceding `\r`) removed; blank lines are skipped. A line that
/// grows to `max_line_bytes` without a terminator is emitted early, cut on a
/// character boundary.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl LineDecoder {
    /// Create a decoder with the given line length limit
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Feed a chunk of received bytes, returning every line it completes
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in chunk {
            if byte == b'\n' {
                self.take_line(&mut lines);
                continue;
            }
            self.buffer.push(byte);
            if self.buffer.len() >= self.max_line_bytes {
                self.split_overlong(&mut lines);
            }
        }

        lines
    }

    /// Flush an unterminated trailing line at end-of-stream
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::with_capacity(1);
        self.take_line(&mut lines);
        lines.pop()
    }

    /// Number of buffered bytes not yet part of a complete line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Emit the buffer up to the last complete UTF-8 character; the bytes of
    /// a character still being received stay buffered for the next line.
    fn split_overlong(&mut self, lines: &mut Vec<String>) {
        let cut = self.buffer.len() - incomplete_char_len(&self.buffer);
        if cut == 0 {
            // Limit smaller than one character; wait for the rest of it
            return;
        }
        let rest = self.buffer.split_off(cut);
        self.take_line(lines);
        self.buffer = rest;
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        let mut raw = std::mem::take(&mut self.buffer);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.is_empty() {
            return;
        }
        lines.push(String::from_utf8_lossy(&raw).into_owned());
    }
}

/// Length of a truncated multi-byte UTF-8 sequence at the end of `bytes`
fn incomplete_char_len(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(4) {
        let byte = bytes[bytes.len() - back];
        // Continuation bytes are 0b10xx_xxxx
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let sender = SessionId::new();
        let msg = Message::new("hello", sender);
        assert_eq!(msg.text(), "hello");
        assert_eq!(msg.sender(), sender);
    }

    #[test]
    fn test_encode_line_appends_single_newline() {
        assert_eq!(encode_line("A : hi"), b"A : hi\n".to_vec());
    }

    #[test]
    fn test_decode_multiple_lines_in_one_chunk() {
        let mut decoder = LineDecoder::default();
        let lines = decoder.decode(b"one\ntwo\nthree\n");
        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_decode_line_split_across_chunks() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.decode(b"hel").is_empty());
        assert_eq!(decoder.pending(), 3);
        assert_eq!(decoder.decode(b"lo\nwor"), vec!["hello"]);
        assert_eq!(decoder.decode(b"ld\n"), vec!["world"]);
    }

    #[test]
    fn test_decode_strips_crlf_and_skips_blank_lines() {
        let mut decoder = LineDecoder::default();
        let lines = decoder.decode(b"hi\r\n\r\n\nthere\r\n");
        assert_eq!(lines, vec!["hi", "there"]);
    }

    #[test]
    fn test_overlong_line_is_flushed() {
        let mut decoder = LineDecoder::new(4);
        let lines = decoder.decode(b"abcdefg\n");
        assert_eq!(lines, vec!["abcd", "efg"]);
    }

    #[test]
    fn test_overlong_line_splits_on_char_boundary() {
        let mut decoder = LineDecoder::new(4);
        let lines = decoder.decode("abcé\n".as_bytes());
        assert_eq!(lines, vec!["abc", "é"]);
        assert_eq!(lines.concat(), "abcé");
        assert!(lines.iter().all(|line| !line.contains('\u{fffd}')));
    }

    #[test]
    fn test_overlong_split_survives_chunk_boundaries() {
        let mut decoder = LineDecoder::new(5);
        let text = "x😀yé😀z\n";
        let mut lines = Vec::new();
        for byte in text.as_bytes() {
            lines.extend(decoder.decode(&[*byte]));
        }
        assert_eq!(lines.concat(), "x😀yé😀z");
        assert!(lines.iter().all(|line| line.len() <= 5));
    }

    #[test]
    fn test_limit_below_char_width_keeps_char_whole() {
        let mut decoder = LineDecoder::new(1);
        let lines = decoder.decode("éa\n".as_bytes());
        assert_eq!(lines, vec!["é", "a"]);
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.decode(b"no newline").is_empty());
        assert_eq!(decoder.finish(), Some("no newline".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut decoder = LineDecoder::default();
        let lines = decoder.decode(b"ok\xff\n");
        assert_eq!(lines, vec!["ok\u{fffd}"]);
    }
}
