//! Request Decoder
//!
//! This module turns raw bytes read from a client socket into [`Command`]s.
//!
//! ## Frame Layout
//!
//! A request frame is a run of bulk strings, optionally preceded by an array
//! count header:
//!
//! ```text
//! *2\r\n$3\r\nGET\r\n$4\r\nname\r\n
//! ```
//!
//! The count header is never checked against the number of bulk strings
//! that actually follow. A frame ends when the next byte starts a new frame
//! (`*`) or when the buffer runs out on a bulk string boundary. Only a header
//! or payload cut off partway means more data is needed.
//!
//! ## How the Parser Works
//!
//! The parser walks the buffer with a cursor and returns either:
//! - `Ok(Some((command, consumed)))` - a full frame was decoded
//! - `Ok(None)` - the frame is incomplete, nothing was consumed
//! - `Err(ParseError)` - the bytes are not a valid frame
//!
//! Every length header is validated before the payload is sliced, so a
//! truncated or lying header can never index past the end of the buffer.

use crate::protocol::types::{prefix, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The buffer ended in the middle of a frame
    #[error("incomplete frame")]
    Incomplete,

    /// A byte other than `$` or `*` where a header was expected
    #[error("expected '$', got byte {0:#04x}")]
    UnexpectedByte(u8),

    /// A length header that is not a decimal integer
    #[error("invalid length header: {0:?}")]
    InvalidInteger(String),

    /// Bulk string length is negative
    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    /// Array count is negative
    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// A header line grew past [`MAX_HEADER_LEN`] without a CRLF
    #[error("length header too long")]
    HeaderTooLong,

    /// The payload of a bulk string was not followed by CRLF
    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    /// The frame decoded to zero strings
    #[error("empty command")]
    EmptyCommand,

    /// The bulk string exceeds the maximum allowed size
    #[error("bulk string too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Longest header line (`$<digits>` or `*<digits>`) accepted before CRLF.
pub const MAX_HEADER_LEN: usize = 32;

/// A decoded request: the command name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, uppercased for matching
    pub name: String,
    /// Arguments in the order they were sent
    pub args: Vec<Bytes>,
}

impl Command {
    /// Builds a command from the decoded strings of one frame.
    ///
    /// The first string becomes the uppercased name.
    pub fn from_parts(mut parts: Vec<Bytes>) -> ParseResult<Self> {
        if parts.is_empty() {
            return Err(ParseError::EmptyCommand);
        }

        let args = parts.split_off(1);
        let name = String::from_utf8_lossy(&parts[0]).to_uppercase();

        Ok(Self { name, args })
    }
}

/// A cursor-based request parser.
///
/// # Example
///
/// ```
/// use pebblekv::protocol::RespParser;
///
/// let parser = RespParser::new();
/// let buffer = b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n";
///
/// let (command, consumed) = parser.parse(buffer).unwrap().unwrap();
/// assert_eq!(command.name, "GET");
/// assert_eq!(consumed, buffer.len());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RespParser {
    /// Largest bulk string the parser accepts
    max_bulk_size: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self {
            max_bulk_size: MAX_BULK_SIZE,
        }
    }

    /// Attempts to decode one frame from the start of the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((command, consumed)))` - Successfully decoded a frame
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Malformed frame
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = 0;
        let mut declared = 0;

        if buf[0] == prefix::ARRAY {
            let (count, header_len) = match read_header(&buf[1..])? {
                Some(header) => header,
                None => return Ok(None),
            };
            if count < 0 {
                return Err(ParseError::InvalidArrayLength(count));
            }
            declared = count as usize;
            cursor = 1 + header_len;
        }

        // Nothing but a count header so far
        if cursor == buf.len() && declared > 0 {
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(declared.min(64));

        while cursor < buf.len() {
            match buf[cursor] {
                // Start of the next pipelined frame
                prefix::ARRAY => break,
                prefix::BULK_STRING => match self.parse_bulk_string(&buf[cursor..])? {
                    Some((data, used)) => {
                        parts.push(data);
                        cursor += used;
                    }
                    None => return Ok(None),
                },
                other => return Err(ParseError::UnexpectedByte(other)),
            }
        }

        let command = Command::from_parts(parts)?;
        Ok(Some((command, cursor)))
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        debug_assert!(buf[0] == prefix::BULK_STRING);

        let (length, header_len) = match read_header(&buf[1..])? {
            Some(header) => header,
            None => return Ok(None),
        };

        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;

        if length > self.max_bulk_size {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.max_bulk_size,
            });
        }

        let data_start = 1 + header_len;
        let total_needed = data_start + length + CRLF.len();
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[data_start + length..total_needed] != CRLF {
            return Err(ParseError::MissingCrlf);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);

        Ok(Some((data, total_needed)))
    }
}

/// Reads a `<integer>\r\n` header line.
///
/// Returns the integer and the number of bytes consumed including CRLF.
fn read_header(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    let end = match find_crlf(buf) {
        Some(pos) => pos,
        None if buf.len() > MAX_HEADER_LEN => return Err(ParseError::HeaderTooLong),
        None => return Ok(None),
    };

    if end > MAX_HEADER_LEN {
        return Err(ParseError::HeaderTooLong);
    }

    let raw = &buf[..end];
    let value = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ParseError::InvalidInteger(String::from_utf8_lossy(raw).into_owned()))?;

    Ok(Some((value, end + CRLF.len())))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Decodes a buffer that is expected to hold exactly one request.
///
/// Bulk strings are read up to the end of the buffer whatever the count
/// header says. A header or payload cut off partway is reported as
/// [`ParseError::Incomplete`]. Bytes after the first frame are ignored.
pub fn decode_command(buf: &[u8]) -> ParseResult<Command> {
    match RespParser::new().parse(buf)? {
        Some((command, _)) => Ok(command),
        None if buf.is_empty() => Err(ParseError::EmptyCommand),
        None => Err(ParseError::Incomplete),
    }
}
