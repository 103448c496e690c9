//! Client error types.

use std::io;

use brook_core::{ConnackCode, ProtocolError};
use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection refused: {0:?}")]
    ConnectionRefused(ConnackCode),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Keep-alive timeout")]
    KeepAliveTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session store error: {0}")]
    Store(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
