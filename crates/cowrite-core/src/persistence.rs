//! Interfaces to the external persistence collaborators
//!
//! The core only ever talks to these traits. Implementations live in
//! `cowrite-storage`.

use crate::operation::Operation;
use crate::session::{Role, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Session metadata store, consulted once when a session is initialized
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Load roster, team and file snapshots; `Ok(None)` if the session does not exist
    async fn load_session(&self, id: &SessionId) -> Result<Option<SessionSeed>, StorageError>;
}

/// Append-only change log, keyed by session, file id and version
///
/// File ids are only unique within a session.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Record a file snapshot; an existing entry for the same
    /// `(session_id, file_id, version)` is overwritten
    async fn append(&self, record: &ChangeRecord) -> Result<(), StorageError>;

    /// Highest version recorded for a file
    async fn latest(
        &self,
        session_id: &SessionId,
        file_id: &str,
    ) -> Result<Option<ChangeRecord>, StorageError>;

    /// Exact version lookup
    async fn get(
        &self,
        session_id: &SessionId,
        file_id: &str,
        version: u64,
    ) -> Result<Option<ChangeRecord>, StorageError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSeed {
    pub id: String,
    pub name: String,
    pub content: String,
    pub version: u64,
}

/// Everything needed to bring a session to life
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSeed {
    pub team_id: Option<String>,
    pub roster: Vec<RosterEntry>,
    pub files: Vec<FileSeed>,
}

/// One durable snapshot of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub session_id: SessionId,
    pub file_id: String,
    pub version: u64,
    pub content: String,
    /// Operations committed since the previous snapshot, when still retained
    pub operations: Vec<Operation>,
    pub author: Option<String>,
    pub timestamp: u64,
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl From<StorageError> for crate::Error {
    fn from(e: StorageError) -> Self {
        crate::Error::PersistenceUnavailable(e.to_string())
    }
}
