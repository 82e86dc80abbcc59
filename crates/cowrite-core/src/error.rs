//! Error types for cowrite core

use thiserror::Error;

use crate::lock::FileLock;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Version conflict: base version {base} does not match current version {current}")]
    VersionConflict { base: u64, current: u64 },

    #[error("Lock denied: {} conflicting lock(s)", conflicting.len())]
    LockDenied { conflicting: Vec<FileLock> },

    #[error("Conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error("Strategy {0} requires merged content")]
    MissingContent(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),
}

impl Error {
    /// Stable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Error::SessionNotFound(_)
            | Error::FileNotFound(_)
            | Error::ParticipantNotFound(_)
            | Error::ConflictNotFound(_) => "NOT_FOUND",
            Error::InvalidSessionId(_) => "INVALID_ID",
            Error::InvalidOperation(_) | Error::MissingContent(_) => "INVALID_OPERATION",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::LockDenied { .. } => "LOCK_DENIED",
            Error::ConflictAlreadyResolved(_) => "ALREADY_RESOLVED",
            Error::PersistenceUnavailable(_) => "PERSISTENCE_UNAVAILABLE",
        }
    }
}

/// Result type alias for cowrite core operations
pub type Result<T> = std::result::Result<T, Error>;
