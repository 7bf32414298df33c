use std::io;
use thiserror::Error;

use crate::transaction::TransactionId;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in STUN transaction handling
#[derive(Error, Debug)]
pub enum Error {
    /// The transport could not send a message.
    #[error("STUN transport error: {0}")]
    Transport(String),

    /// The message could not be encoded for the wire.
    #[error("Message encoding failed: {0}")]
    Encode(String),

    /// A datagram could not be decoded into a message.
    #[error("Message decoding failed: {0}")]
    Decode(String),

    /// A transaction identifier of the wrong width or otherwise unusable.
    #[error("Invalid transaction ID: {0}")]
    InvalidTransactionId(String),

    /// A message of the wrong class was handed to a transaction.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Transaction not found for the given ID.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Transaction with the given ID already exists.
    #[error("Transaction already exists: {0}")]
    TransactionExists(TransactionId),

    /// Configuration could not be loaded.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal channel error (e.g., receiver dropped).
    #[error("Internal channel closed")]
    ChannelClosed,

    /// Other miscellaneous errors.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Wraps a lower-level send failure with some context.
    pub fn transport_error(e: impl std::fmt::Display, context: &str) -> Self {
        Error::Transport(format!("{}: {}", context, e))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
