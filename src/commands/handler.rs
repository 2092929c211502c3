//! Command Dispatcher
//!
//! Maps a decoded [`Command`] onto the storage engine and builds the reply.
//!
//! ## Supported Commands
//!
//! - `PING [arg ...]` - Always answers `PONG`
//! - `ECHO [arg ...]` - Answers each argument as a bulk string, in order
//! - `SET key value [PX milliseconds]` - Set a key, optionally with a TTL
//! - `GET key` - Get a key's value, or null if absent or expired
//! - `QUIT` - Answers `OK`, then the connection is closed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  execute()  │───>│  dispatch() │───>│   cmd_*()   │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │                                               │             │
//! │                                               ▼             │
//! │                                      StorageEngine          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{CommandError, CommandResult};
use crate::protocol::{Command, RespValue};
use crate::storage::StorageEngine;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// The reply to a command, and whether the connection should close after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub value: RespValue,
    pub close: bool,
}

impl Response {
    fn reply(value: RespValue) -> Self {
        Self {
            value,
            close: false,
        }
    }

    fn reply_and_close(value: RespValue) -> Self {
        Self { value, close: true }
    }
}

/// Executes commands against the shared storage engine.
///
/// Cloning is cheap; every connection holds its own handle.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
}

impl CommandHandler {
    /// Creates a new command handler with the given storage engine.
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        Self { storage }
    }

    /// Executes a command and returns the response.
    ///
    /// Failures never escape: they become `-ERR` replies.
    pub fn execute(&self, command: Command) -> Response {
        if command.name == "QUIT" {
            return Response::reply_and_close(RespValue::ok());
        }

        match self.dispatch(&command.name, &command.args) {
            Ok(value) => Response::reply(value),
            Err(err) => Response::reply(err.into()),
        }
    }

    /// Dispatches a command to its handler.
    fn dispatch(&self, cmd: &str, args: &[Bytes]) -> CommandResult<RespValue> {
        match cmd {
            "PING" => Ok(RespValue::pong()),
            "ECHO" => Ok(self.cmd_echo(args)),
            "SET" => self.cmd_set(args),
            "GET" => self.cmd_get(args),
            _ => Err(CommandError::UnknownCommand),
        }
    }

    /// ECHO [arg ...]
    fn cmd_echo(&self, args: &[Bytes]) -> RespValue {
        RespValue::sequence(args.iter().cloned().map(RespValue::bulk_string).collect())
    }

    /// SET key value [PX milliseconds]
    fn cmd_set(&self, args: &[Bytes]) -> CommandResult<RespValue> {
        let millis = match args {
            [_, _] => None,
            [_, _, option, millis] => Some(parse_px(option, millis)?),
            _ => return Err(CommandError::wrong_arity("SET")),
        };

        let (key, value) = (args[0].clone(), args[1].clone());
        match millis {
            // A negative TTL is accepted and leaves the key already expired
            Some(millis) if millis < 0 => self.storage.set_expired(key, value),
            Some(millis) => {
                let ttl = Duration::from_millis(millis.unsigned_abs());
                self.storage.set(key, value, Some(ttl))
            }
            None => self.storage.set(key, value, None),
        };
        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[Bytes]) -> CommandResult<RespValue> {
        let [key] = args else {
            return Err(CommandError::wrong_arity("GET"));
        };

        Ok(match self.storage.get(key) {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        })
    }
}

/// Parses the `PX <milliseconds>` option pair of `SET`.
///
/// The option token is checked before the number. Any integer is accepted.
fn parse_px(option: &[u8], millis: &[u8]) -> CommandResult<i64> {
    if !option.eq_ignore_ascii_case(b"PX") {
        return Err(CommandError::InvalidArgument);
    }

    std::str::from_utf8(millis)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(CommandError::InvalidExpiry)
}
