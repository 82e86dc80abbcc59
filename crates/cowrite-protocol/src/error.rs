//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Not joined to a session")]
    NotJoined,

    #[error("{0}")]
    Core(#[from] cowrite_core::Error),
}

impl ProtocolError {
    /// Stable error code sent on the wire
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::InvalidCommand(_) => "INVALID_CMD",
            ProtocolError::InvalidJson(_) => "INVALID_JSON",
            ProtocolError::MessageTooLarge { .. } => "TOO_LARGE",
            ProtocolError::NotJoined => "NOT_JOINED",
            ProtocolError::Core(e) => e.code(),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_syntax() || e.is_eof() {
            ProtocolError::InvalidJson(e.to_string())
        } else {
            ProtocolError::InvalidCommand(e.to_string())
        }
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
