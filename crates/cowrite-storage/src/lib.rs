//! Cowrite Storage Backends
//!
//! Implementations of the core's persistence collaborators
//! ([`SessionSource`] and [`ChangeLog`]) plus a small catalog used to
//! register sessions:
//! - Memory (default): Fast, volatile storage
//! - SQLite: Embedded persistence

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use cowrite_core::{ChangeRecord, SessionId, SessionSeed};
use tracing::debug;

pub use cowrite_core::{ChangeLog, SessionSource, StorageError};

/// Registration of sessions in a metadata store
#[async_trait]
pub trait SessionCatalog: Send + Sync {
    /// Store or replace a session's metadata
    async fn save_session(&self, id: &SessionId, seed: &SessionSeed)
        -> Result<(), StorageError>;

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StorageError>;

    /// List session IDs matching a glob pattern (`prefix*`, `*suffix`, exact)
    async fn list_sessions(&self, pattern: Option<&str>)
        -> Result<Vec<SessionId>, StorageError>;

    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub session_count: usize,
    pub record_count: usize,
}

/// Bring seeded file snapshots forward to the newest logged version
///
/// Records logged by any other session are ignored.
pub(crate) fn apply_latest(
    id: &SessionId,
    seed: &mut SessionSeed,
    latest: impl Fn(&str) -> Option<ChangeRecord>,
) {
    for file in &mut seed.files {
        if let Some(record) = latest(&file.id).filter(|r| &r.session_id == id) {
            if record.version > file.version {
                debug!(
                    session = %id,
                    file = %file.id,
                    from = file.version,
                    to = record.version,
                    "Resuming file from change log"
                );
                file.version = record.version;
                file.content = record.content;
            }
        }
    }
}

/// Simple glob pattern matching
pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }

    key == pattern
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
