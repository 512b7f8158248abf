//! Error types for the vmlink library

use crate::types::{CloseReason, ConnectionState};
use thiserror::Error;

/// Result type alias for control-channel operations
pub type Result<T> = std::result::Result<T, ControlError>;

/// Error types for control-channel operations
#[derive(Error, Debug)]
pub enum ControlError {
    /// Address resolution or TCP connect failed
    #[error("Connection error: {0}")]
    Connect(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Well-formed traffic that the protocol does not allow here
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload could not be decoded as a MessagePack value
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Message could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Declared frame length above the hard limit
    #[error("Received oversize message of length {0}")]
    OversizeMessage(usize),

    /// A send was attempted while the connection was in the wrong state.
    /// This is a bug in the caller, not a remote fault.
    #[error("Cannot send {operation} in state {state:?}")]
    InvalidSendState {
        operation: &'static str,
        state: ConnectionState,
    },

    /// Configuration file error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection is gone
    #[error("Connection closed")]
    Closed,

    /// A session ended for a reason other than a local close
    #[error("Session ended: {0}")]
    SessionEnded(CloseReason),
}

impl ControlError {
    /// Whether this error indicates a local logic bug rather than a remote or
    /// transport failure.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, ControlError::InvalidSendState { .. })
    }
}
