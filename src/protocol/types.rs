//! Reply Types
//!
//! This module defines the values the server writes back to clients.
//! Only the part of RESP this server speaks is modelled here:
//!
//! - `+` Simple String (status replies such as `+OK`)
//! - `-` Error
//! - `$` Bulk String, and the null bulk string `$-1`
//!
//! All types are terminated with CRLF (`\r\n`).
//!
//! ## Examples
//!
//! Simple String: `+PONG\r\n`
//! Error: `-ERR unknown command\r\n`
//! Bulk String: `$5\r\nhello\r\n`
//! Null Bulk String: `$-1\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A reply value, ready to be serialized onto the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Status reply. Cannot contain CRLF.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Error reply.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// Binary-safe string.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string: `$-1\r\n`
    Null,

    /// Several replies written back-to-back with no array header.
    ///
    /// `ECHO a b` answers with two bulk strings in a row. An empty sequence
    /// serializes to nothing at all.
    Sequence(Vec<RespValue>),
}

impl RespValue {
    /// Creates a new simple string response.
    ///
    /// # Example
    /// ```
    /// use pebblekv::protocol::types::RespValue;
    /// let ok = RespValue::simple_string("OK");
    /// assert_eq!(ok.serialize(), b"+OK\r\n");
    /// ```
    pub fn simple_string(s: impl Into<String>) -> Self {
        RespValue::SimpleString(s.into())
    }

    /// Creates a new error response.
    ///
    /// # Example
    /// ```
    /// use pebblekv::protocol::types::RespValue;
    /// let err = RespValue::error("ERR unknown command");
    /// assert_eq!(err.serialize(), b"-ERR unknown command\r\n");
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        RespValue::Error(s.into())
    }

    /// Creates a new bulk string response.
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates a null response.
    pub fn null() -> Self {
        RespValue::Null
    }

    /// Creates a back-to-back sequence of replies.
    pub fn sequence(values: Vec<RespValue>) -> Self {
        RespValue::Sequence(values)
    }

    /// Common response for successful operations
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    /// Common response for PONG
    pub fn pong() -> Self {
        RespValue::SimpleString("PONG".to_string())
    }

    /// Serializes the value to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the value into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            RespValue::BulkString(data) => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => {
                buf.push(prefix::BULK_STRING);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            RespValue::Sequence(values) => {
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "{}", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Sequence(values) => {
                if values.is_empty() {
                    write!(f, "(empty)")
                } else {
                    for (i, v) in values.iter().enumerate() {
                        if i > 0 {
                            writeln!(f)?;
                        }
                        write!(f, "{}) {}", i + 1, v)?;
                    }
                    Ok(())
                }
            }
        }
    }
}
