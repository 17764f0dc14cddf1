//! Error kinds shared by the server session handler and the client session

use std::io;
use thiserror::Error;

/// Malformed traffic. Reported to the peer as a textual reply; the session continues.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown command.")]
    UnknownCommand(String),
    #[error("{command} expects {expected} fields, got {got}")]
    FieldCount {
        command: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid size field: {0:?}")]
    InvalidSize(String),
    #[error("invalid {what}: {value:?}")]
    InvalidField { what: &'static str, value: String },
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("unexpected frame: {0:?}")]
    Unexpected(String),
}

#[derive(Debug, Error)]
pub enum TransferError {
    /// Socket-level failure; the session or operation is over.
    #[error("connection error: {0}")]
    Connection(#[source] io::Error),
    #[error("connection closed early ({received} of {expected} bytes)")]
    PeerClosed { expected: u64, received: u64 },
    /// A bulk transfer was already announced and could not be completed.
    #[error("transfer aborted: {0}")]
    Aborted(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("File not found.")]
    NotFound,
    #[error("Name already in use")]
    NameCollision,
    #[error("Invalid name.")]
    InvalidName,
    /// Local disk failure while reading a source or writing a destination.
    #[error("{0}")]
    Io(#[from] io::Error),
    /// Error text returned by the server.
    #[error("server error: {0}")]
    Server(String),
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl TransferError {
    /// Whether the connection can no longer be used after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::Connection(_)
                | TransferError::PeerClosed { .. }
                | TransferError::Aborted(_)
                | TransferError::Protocol(ProtocolError::FrameTooLarge(_))
        )
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse registry {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to persist registry: {0}")]
    Persist(#[source] io::Error),
    #[error("failed to encode registry: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
