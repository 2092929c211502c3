//! Wire Protocol
//!
//! The subset of the Redis Serialization Protocol (RESP) this server speaks.
//!
//! ## Modules
//!
//! - `types`: Defines the `RespValue` reply enum and its serialization
//! - `parser`: Cursor-based decoder for incoming request frames
//!
//! ## Example
//!
//! ```
//! use pebblekv::protocol::{decode_command, RespValue};
//! use bytes::Bytes;
//!
//! // Decoding a request
//! let command = decode_command(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n").unwrap();
//! assert_eq!(command.name, "GET");
//!
//! // Encoding a reply
//! let response = RespValue::bulk_string(Bytes::from("Rosa"));
//! assert_eq!(response.serialize(), b"$4\r\nRosa\r\n");
//! ```

pub mod parser;
pub mod types;

pub use parser::{decode_command, Command, ParseError, ParseResult, RespParser};
pub use types::RespValue;
