//! IPC errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Unknown reply '{0}'")]
    UnknownReply(String),

    #[error("Invalid interface name '{0}'")]
    InvalidInterface(String),

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel closed")]
    Closed,
}
