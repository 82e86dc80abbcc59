//! In-memory storage backend

use crate::{apply_latest, matches_pattern, SessionCatalog, StorageStats};
use async_trait::async_trait;
use cowrite_core::{
    ChangeLog, ChangeRecord, SessionId, SessionSeed, SessionSource, StorageError,
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// In-memory storage backend
///
/// Fast, volatile storage suitable for development and tests.
/// Data is lost when the process exits.
pub struct MemoryStorage {
    sessions: DashMap<SessionId, SessionSeed>,
    /// (session, file id) -> version -> record
    records: DashMap<(SessionId, String), BTreeMap<u64, ChangeRecord>>,
    /// When set, every call fails with a connection error
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            records: DashMap::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate an unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(StorageError::Connection(
                "memory store marked unavailable".into(),
            ));
        }
        Ok(())
    }

    fn latest_record(&self, session_id: &SessionId, file_id: &str) -> Option<ChangeRecord> {
        self.records
            .get(&(session_id.clone(), file_id.to_string()))
            .and_then(|versions| versions.values().next_back().cloned())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionSource for MemoryStorage {
    async fn load_session(&self, id: &SessionId) -> Result<Option<SessionSeed>, StorageError> {
        self.check_available()?;

        let Some(mut seed) = self.sessions.get(id).map(|s| s.value().clone()) else {
            return Ok(None);
        };
        apply_latest(id, &mut seed, |file_id| self.latest_record(id, file_id));
        Ok(Some(seed))
    }
}

#[async_trait]
impl ChangeLog for MemoryStorage {
    async fn append(&self, record: &ChangeRecord) -> Result<(), StorageError> {
        self.check_available()?;
        self.records
            .entry((record.session_id.clone(), record.file_id.clone()))
            .or_default()
            .insert(record.version, record.clone());
        Ok(())
    }

    async fn latest(
        &self,
        session_id: &SessionId,
        file_id: &str,
    ) -> Result<Option<ChangeRecord>, StorageError> {
        self.check_available()?;
        Ok(self.latest_record(session_id, file_id))
    }

    async fn get(
        &self,
        session_id: &SessionId,
        file_id: &str,
        version: u64,
    ) -> Result<Option<ChangeRecord>, StorageError> {
        self.check_available()?;
        Ok(self
            .records
            .get(&(session_id.clone(), file_id.to_string()))
            .and_then(|versions| versions.get(&version).cloned()))
    }
}

#[async_trait]
impl SessionCatalog for MemoryStorage {
    async fn save_session(
        &self,
        id: &SessionId,
        seed: &SessionSeed,
    ) -> Result<(), StorageError> {
        self.check_available()?;
        self.sessions.insert(id.clone(), seed.clone());
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(self.sessions.remove(id).is_some())
    }

    async fn list_sessions(
        &self,
        pattern: Option<&str>,
    ) -> Result<Vec<SessionId>, StorageError> {
        self.check_available()?;
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| pattern.map_or(true, |p| matches_pattern(entry.key().as_str(), p)))
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            session_count: self.sessions.len(),
            record_count: self.records.iter().map(|entry| entry.value().len()).sum(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::FileSeed;

    fn seed() -> SessionSeed {
        SessionSeed {
            team_id: Some("team".into()),
            roster: vec![],
            files: vec![FileSeed {
                id: "lib.rs".into(),
                name: "lib.rs".into(),
                content: "v1".into(),
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
            file_id: "lib.rs".into(),
            version,
            content: content.into(),
            operations: vec![],
            author: Some("ana".into()),
            timestamp: version,
        }
    }

    #[tokio::test]
    async fn test_save_and_load_session() {
        let storage = MemoryStorage::new();
        let id = SessionId::new("s1").unwrap();

        assert!(storage.load_session(&id).await.unwrap().is_none());

        storage.save_session(&id, &seed()).await.unwrap();
        let loaded = storage.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded, seed());
    }

    #[tokio::test]
    async fn test_load_resumes_from_latest_record() {
        let storage = MemoryStorage::new();
        let id = SessionId::new("s1").unwrap();
        storage.save_session(&id, &seed()).await.unwrap();

        storage.append(&record(3, "v3")).await.unwrap();
        storage.append(&record(2, "v2")).await.unwrap();

        let loaded = storage.load_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.files[0].version, 3);
        assert_eq!(loaded.files[0].content, "v3");
    }

    #[tokio::test]
    async fn test_sessions_sharing_a_file_id_resume_separately() {
        let storage = MemoryStorage::new();
        storage.save_session(&sid("s1"), &seed()).await.unwrap();
        storage.save_session(&sid("s2"), &seed()).await.unwrap();

        storage.append(&record(5, "s1 private edits")).await.unwrap();

        let s2 = storage.load_session(&sid("s2")).await.unwrap().unwrap();
        assert_eq!(s2.files[0].version, 1);
        assert_eq!(s2.files[0].content, "v1");
        assert!(storage.latest(&sid("s2"), "lib.rs").await.unwrap().is_none());

        let s1 = storage.load_session(&sid("s1")).await.unwrap().unwrap();
        assert_eq!(s1.files[0].version, 5);
        assert_eq!(s1.files[0].content, "s1 private edits");
    }

    #[tokio::test]
    async fn test_append_overwrites_same_version() {
        let storage = MemoryStorage::new();

        storage.append(&record(2, "first")).await.unwrap();
        storage.append(&record(2, "second")).await.unwrap();

        let s1 = sid("s1");
        assert_eq!(storage.get(&s1, "lib.rs", 2).await.unwrap().unwrap().content, "second");
        assert!(storage.get(&s1, "lib.rs", 1).await.unwrap().is_none());
        assert!(storage.get(&sid("s2"), "lib.rs", 2).await.unwrap().is_none());
        assert_eq!(storage.stats().await.unwrap().record_count, 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let storage = MemoryStorage::new();
        storage.set_unavailable(true);

        let id = SessionId::new("s1").unwrap();
        assert!(matches!(
            storage.load_session(&id).await,
            Err(StorageError::Connection(_))
        ));
        assert!(storage.append(&record(1, "x")).await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_pattern() {
        let storage = MemoryStorage::new();

        for name in ["team:a", "team:b", "solo"] {
            storage
                .save_session(&SessionId::new(name).unwrap(), &SessionSeed::default())
                .await
                .unwrap();
        }

        assert_eq!(storage.list_sessions(Some("team:*")).await.unwrap().len(), 2);
        assert_eq!(storage.list_sessions(None).await.unwrap().len(), 3);
        assert!(storage.delete_session(&SessionId::new("solo").unwrap()).await.unwrap());
        assert_eq!(storage.stats().await.unwrap().session_count, 2);
    }
}
