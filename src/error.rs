//! Command-level errors.
//!
//! Every variant is recoverable: the dispatcher turns it into an error reply
//! on the same connection and the client can keep issuing commands.

use crate::protocol::{ParseError, RespValue};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Wrong argument count. Holds the lowercase command name.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// `SET` option token other than `PX`
    #[error("Invalid argument")]
    InvalidArgument,

    /// `SET ... PX` with a value that is not an integer
    #[error("Invalid expiry time")]
    InvalidExpiry,

    #[error("unknown command")]
    UnknownCommand,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ParseError),
}

impl CommandError {
    pub fn wrong_arity(command: &str) -> Self {
        CommandError::WrongArity(command.to_lowercase())
    }

    /// Renders the error as the reply sent to the client.
    pub fn to_resp(&self) -> RespValue {
        RespValue::error(format!("ERR {self}"))
    }
}

impl From<CommandError> for RespValue {
    fn from(err: CommandError) -> Self {
        err.to_resp()
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
