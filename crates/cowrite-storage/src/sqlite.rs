//! SQLite storage backend

use crate::{apply_latest, matches_pattern, SessionCatalog, StorageStats};
use async_trait::async_trait;
use cowrite_core::{
    ChangeLog, ChangeRecord, Operation, SessionId, SessionSeed, SessionSource, StorageError,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

/// SQLite storage backend
///
/// Embedded persistence for single-node setups. Session metadata is stored
/// as JSON; the change log is keyed by `(session_id, file_id, version)`.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

impl SqliteStorage {
    /// Create a new SQLite storage with the given path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                seed TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
            );

            CREATE TABLE IF NOT EXISTS change_log (
                session_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                operations TEXT NOT NULL,
                author TEXT,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (session_id, file_id, version)
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn latest_record(
        conn: &Connection,
        session_id: &SessionId,
        file_id: &str,
    ) -> Result<Option<ChangeRecord>, StorageError> {
        let row = conn
            .query_row(
                "SELECT file_id, version, session_id, content, operations, author, timestamp
                 FROM change_log WHERE session_id = ?1 AND file_id = ?2
                 ORDER BY version DESC LIMIT 1",
                params![session_id.as_str(), file_id],
                RawRecord::from_row,
            )
            .optional()
            .map_err(db_err)?;

        row.map(RawRecord::into_record).transpose()
    }
}

/// Change-log row before JSON decoding
struct RawRecord {
    file_id: String,
    version: i64,
    session_id: String,
    content: String,
    operations: String,
    author: Option<String>,
    timestamp: i64,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get(0)?,
            version: row.get(1)?,
            session_id: row.get(2)?,
            content: row.get(3)?,
            operations: row.get(4)?,
            author: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<ChangeRecord, StorageError> {
        let operations: Vec<Operation> =
            serde_json::from_str(&self.operations).map_err(ser_err)?;
        let session_id = SessionId::new(self.session_id)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(ChangeRecord {
            session_id,
            file_id: self.file_id,
            version: self.version as u64,
            content: self.content,
            operations,
            author: self.author,
            timestamp: self.timestamp as u64,
        })
    }
}

#[async_trait]
impl SessionSource for SqliteStorage {
    async fn load_session(&self, id: &SessionId) -> Result<Option<SessionSeed>, StorageError> {
        let conn = self.conn.lock();

        let raw: Option<String> = conn
            .query_row(
                "SELECT seed FROM sessions WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut seed: SessionSeed = serde_json::from_str(&raw).map_err(ser_err)?;

        let mut latest = Vec::with_capacity(seed.files.len());
        for file in &seed.files {
            if let Some(record) = Self::latest_record(&conn, id, &file.id)? {
                latest.push(record);
            }
        }
        apply_latest(id, &mut seed, |file_id| {
            latest.iter().find(|r| r.file_id == file_id).cloned()
        });

        Ok(Some(seed))
    }
}

#[async_trait]
impl ChangeLog for SqliteStorage {
    async fn append(&self, record: &ChangeRecord) -> Result<(), StorageError> {
        let operations = serde_json::to_string(&record.operations).map_err(ser_err)?;
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO change_log
                (session_id, file_id, version, content, operations, author, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(session_id, file_id, version) DO UPDATE SET
                content = excluded.content,
                operations = excluded.operations,
                author = excluded.author,
                timestamp = excluded.timestamp
            "#,
            params![
                record.session_id.as_str(),
                record.file_id,
                record.version as i64,
                record.content,
                operations,
                record.author,
                record.timestamp as i64,
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }

    async fn latest(
        &self,
        session_id: &SessionId,
        file_id: &str,
    ) -> Result<Option<ChangeRecord>, StorageError> {
        let conn = self.conn.lock();
        Self::latest_record(&conn, session_id, file_id)
    }

    async fn get(
        &self,
        session_id: &SessionId,
        file_id: &str,
        version: u64,
    ) -> Result<Option<ChangeRecord>, StorageError> {
        let conn = self.conn.lock();

        let row = conn
            .query_row(
                "SELECT file_id, version, session_id, content, operations, author, timestamp
                 FROM change_log WHERE session_id = ?1 AND file_id = ?2 AND version = ?3",
                params![session_id.as_str(), file_id, version as i64],
                RawRecord::from_row,
            )
            .optional()
            .map_err(db_err)?;

        row.map(RawRecord::into_record).transpose()
    }
}

#[async_trait]
impl SessionCatalog for SqliteStorage {
    async fn save_session(
        &self,
        id: &SessionId,
        seed: &SessionSeed,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(seed).map_err(ser_err)?;
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO sessions (id, seed, updated_at)
            VALUES (?1, ?2, strftime('%s', 'now') * 1000)
            ON CONFLICT(id) DO UPDATE SET
                seed = excluded.seed,
                updated_at = excluded.updated_at
            "#,
            params![id.as_str(), json],
        )
        .map_err(db_err)?;

        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StorageError> {
        let conn = self.conn.lock();

        let affected = conn
            .execute("DELETE FROM sessions WHERE id = ?1", params![id.as_str()])
            .map_err(db_err)?;

        Ok(affected > 0)
    }

    async fn list_sessions(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<SessionId>, StorageError> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare("SELECT id FROM sessions ORDER BY id").map_err(db_err)?;
        let ids: Vec<SessionId> = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .filter(|id| pattern.map_or(true, |p| matches_pattern(id, p)))
            .filter_map(|id| SessionId::new(id).ok())
            .collect();

        Ok(ids)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();

        let session_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(db_err)?;
        let record_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM change_log", [], |row| row.get(0))
            .map_err(db_err)?;

        Ok(StorageStats {
            session_count: session_count as usize,
            record_count: record_count as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::{FileSeed, Role, RosterEntry};

    fn seed() -> SessionSeed {
        SessionSeed {
            team_id: Some("team".into()),
            roster: vec![RosterEntry {
                user_id: "ana".into(),
                role: Role::Owner,
            }],
            files: vec![FileSeed {
                id: "main.rs".into(),
                name: "main.rs".into(),
                content: "fn main() {}".into(),
                version: 1,
            }],
        }
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    fn record(version: u64, content: &str) -> ChangeRecord {
        ChangeRecord {
            session_id: sid("s1"),
            file_id: "main.rs".into(),
            version,
            content: content.into(),
            operations: vec![Operation::insert(0, "x", "ana")],
            author: Some("ana".into()),
            timestamp: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_sqlite_session_roundtrip() {
        let storage = SqliteStorage::in_memory().unwrap();
        let id = SessionId::new("s1").unwrap();

        assert!(storage.load_session(&id).await.unwrap().is_none());
        storage.save_session(&id, &seed()).await.unwrap();

        let loaded = storage.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.roster[0].role, Role::Owner);
        assert_eq!(loaded.files[0].content, "fn main() {}");
    }

    #[tokio::test]
    async fn test_sqlite_change_log_upsert() {
        let storage = SqliteStorage::in_memory().unwrap();

        storage.append(&record(2, "a")).await.unwrap();
        storage.append(&record(2, "b")).await.unwrap();
        storage.append(&record(3, "c")).await.unwrap();

        let s1 = sid("s1");
        assert_eq!(storage.get(&s1, "main.rs", 2).await.unwrap().unwrap().content, "b");
        let latest = storage.latest(&s1, "main.rs").await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        assert_eq!(latest.operations.len(), 1);
        assert_eq!(storage.stats().await.unwrap().record_count, 2);
    }

    #[tokio::test]
    async fn test_sqlite_load_resumes_from_latest_record() {
        let storage = SqliteStorage::in_memory().unwrap();
        let id = SessionId::new("s1").unwrap();
        storage.save_session(&id, &seed()).await.unwrap();
        storage.append(&record(7, "fn main() { run() }")).await.unwrap();

        let loaded = storage.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.files[0].version, 7);
        assert_eq!(loaded.files[0].content, "fn main() { run() }");
    }

    #[tokio::test]
    async fn test_sqlite_change_log_is_scoped_by_session() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage.save_session(&sid("s1"), &seed()).await.unwrap();
        storage.save_session(&sid("s2"), &seed()).await.unwrap();

        storage.append(&record(5, "s1 private edits")).await.unwrap();
        let mut other = record(5, "s2 edits");
        other.session_id = sid("s2");
        storage.append(&other).await.unwrap();

        let s1 = sid("s1");
        let own = storage.get(&s1, "main.rs", 5).await.unwrap().unwrap();
        assert_eq!(own.content, "s1 private edits");
        assert_eq!(storage.stats().await.unwrap().record_count, 2);

        storage.append(&record(6, "s1 later")).await.unwrap();
        let s2 = storage.load_session(&sid("s2")).await.unwrap().unwrap();
        assert_eq!(s2.files[0].version, 5);
        assert_eq!(s2.files[0].content, "s2 edits");
    }

    #[tokio::test]
    async fn test_sqlite_list_pattern() {
        let storage = SqliteStorage::in_memory().unwrap();

        for i in 0..3 {
            let id = SessionId::new(format!("team:{}", i)).unwrap();
            storage.save_session(&id, &SessionSeed::default()).await.unwrap();
        }
        storage
            .save_session(&SessionId::new("solo").unwrap(), &SessionSeed::default())
            .await
            .unwrap();

        assert_eq!(storage.list_sessions(Some("team:*")).await.unwrap().len(), 3);
        assert_eq!(storage.list_sessions(None).await.unwrap().len(), 4);
    }
}
