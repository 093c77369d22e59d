//! Message framing.
//!
//! Two mutually exclusive conventions split a connection's byte stream
//! into messages:
//!
//! ```text
//! Text: Message 1\n          -> "Message 1"   (response: <reply>\n)
//! Raw:  <up to buffer_size>  -> Bytes         (no response)
//! ```
//!
//! A trailing `\r` before the `\n` is stripped, so CRLF clients work too.

use bytes::BytesMut;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Default raw chunk size.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Default upper bound for a single text line.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Framing mode, chosen once per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Newline-delimited UTF-8 text, one response line per request line.
    #[default]
    Text,
    /// Fixed-size raw chunks, no response.
    Raw,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Text => f.write_str("text"),
            Framing::Raw => f.write_str("raw"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("text") {
            Ok(Framing::Text)
        } else if s.eq_ignore_ascii_case("raw") {
            Ok(Framing::Raw)
        } else {
            Err(format!("unknown framing '{s}', expected 'text' or 'raw'"))
        }
    }
}

/// Result of extracting a line from the read buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum LineResult {
    /// A complete line, terminator removed.
    Complete(String),
    /// No complete line buffered yet.
    Incomplete,
    /// The line is longer than allowed.
    TooLong,
    /// The line is not valid UTF-8.
    InvalidUtf8,
}

/// Take the next `\n`-terminated line out of `buffer`.
///
/// Consumed bytes are removed from the buffer; an incomplete line is left
/// in place for the next read.
pub fn take_line(buffer: &mut BytesMut, max_len: usize) -> LineResult {
    let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
        if buffer.len() > max_len + 1 {
            return LineResult::TooLong;
        }
        return LineResult::Incomplete;
    };

    let mut line = buffer.split_to(pos + 1);
    line.truncate(pos);
    decode(line, max_len)
}

/// Take whatever is left in `buffer` as a final, unterminated line.
///
/// Used at end of stream. Returns `Incomplete` if nothing is buffered.
pub fn take_remainder(buffer: &mut BytesMut, max_len: usize) -> LineResult {
    if buffer.is_empty() {
        return LineResult::Incomplete;
    }
    let line = buffer.split();
    decode(line, max_len)
}

fn decode(mut line: BytesMut, max_len: usize) -> LineResult {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.len() > max_len {
        return LineResult::TooLong;
    }
    match String::from_utf8(line.to_vec()) {
        Ok(s) => LineResult::Complete(s),
        Err(_) => LineResult::InvalidUtf8,
    }
}
