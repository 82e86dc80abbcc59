//! Periodic maintenance: session expiry, presence aging and durability

use crate::persistence::ChangeLog;
use crate::registry::SessionRegistry;
use crate::session::{now_millis, SessionId};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sweep intervals and thresholds, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often idle sessions and expired locks are swept
    pub expiry_interval_secs: u64,
    /// Sessions quiet for longer than this are dropped
    pub session_idle_timeout_secs: u64,
    pub presence_interval_secs: u64,
    pub idle_after_secs: u64,
    pub away_after_secs: u64,
    /// How often changed files are written to the change log
    pub durability_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: 300,
            session_idle_timeout_secs: 2 * 60 * 60,
            presence_interval_secs: 60,
            idle_after_secs: 120,
            away_after_secs: 300,
            durability_interval_secs: 600,
        }
    }
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub sessions_removed: Vec<SessionId>,
    pub locks_released: usize,
}

/// Result of one durability sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurabilityReport {
    pub written: usize,
    pub failed: usize,
}

pub struct MaintenanceScheduler {
    registry: Arc<SessionRegistry>,
    change_log: Arc<dyn ChangeLog>,
    config: MaintenanceConfig,
    /// Last version written per (session, file)
    flushed: DashMap<(SessionId, String), u64>,
}

impl MaintenanceScheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        change_log: Arc<dyn ChangeLog>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            registry,
            change_log,
            config,
            flushed: DashMap::new(),
        }
    }

    pub fn run_expiry_sweep(&self, now: u64) -> ExpiryReport {
        let locks_released = self.registry.purge_expired_locks(now);
        let sessions_removed = self
            .registry
            .expire_idle(now, self.config.session_idle_timeout_secs * 1000);

        for id in &sessions_removed {
            self.flushed.retain(|(session, _), _| session != id);
        }

        if !sessions_removed.is_empty() || locks_released > 0 {
            info!(
                sessions = sessions_removed.len(),
                locks = locks_released,
                "Expiry sweep removed stale state"
            );
        }

        ExpiryReport {
            sessions_removed,
            locks_released,
        }
    }

    pub fn run_presence_sweep(&self, now: u64) -> usize {
        let changed = self.registry.age_presence(
            now,
            self.config.idle_after_secs * 1000,
            self.config.away_after_secs * 1000,
        );
        if changed > 0 {
            debug!(changed, "Presence sweep");
        }
        changed
    }

    /// Write every file that changed since its last successful flush
    ///
    /// A failed write is logged and retried on the next sweep; it never
    /// stops the remaining files.
    pub async fn run_durability_sweep(&self) -> DurabilityReport {
        let records = self.registry.file_snapshots(|session, file| {
            self.flushed
                .get(&(session.clone(), file.to_string()))
                .map(|v| *v.value())
        });

        let mut report = DurabilityReport::default();
        for record in records {
            match self.change_log.append(&record).await {
                Ok(()) => {
                    let key = (record.session_id.clone(), record.file_id.clone());
                    self.flushed.insert(key, record.version);
                    report.written += 1;
                }
                Err(e) => {
                    warn!(
                        session = %record.session_id,
                        file = %record.file_id,
                        version = record.version,
                        error = %e,
                        "Failed to persist file snapshot"
                    );
                    report.failed += 1;
                }
            }
        }

        if report.written > 0 || report.failed > 0 {
            info!(written = report.written, failed = report.failed, "Durability sweep");
        }
        report
    }

    /// Start the three sweep loops on the current runtime
    pub fn spawn(self: Arc<Self>) -> MaintenanceHandle {
        let expiry = {
            let scheduler = self.clone();
            let period = Duration::from_secs(self.config.expiry_interval_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    scheduler.run_expiry_sweep(now_millis());
                }
            })
        };

        let presence = {
            let scheduler = self.clone();
            let period = Duration::from_secs(self.config.presence_interval_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    scheduler.run_presence_sweep(now_millis());
                }
            })
        };

        let durability = {
            let scheduler = self.clone();
            let period = Duration::from_secs(self.config.durability_interval_secs.max(1));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    scheduler.run_durability_sweep().await;
                }
            })
        };

        info!(
            expiry_secs = self.config.expiry_interval_secs,
            presence_secs = self.config.presence_interval_secs,
            durability_secs = self.config.durability_interval_secs,
            "Maintenance scheduler started"
        );

        MaintenanceHandle {
            scheduler: self,
            tasks: vec![expiry, presence, durability],
        }
    }
}

/// Running sweep loops
pub struct MaintenanceHandle {
    scheduler: Arc<MaintenanceScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stop the loops, then flush once more
    pub async fn shutdown(self) -> DurabilityReport {
        for task in &self.tasks {
            task.abort();
        }
        self.scheduler.run_durability_sweep().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::persistence::{ChangeRecord, FileSeed, SessionSeed, SessionSource, StorageError};
    use crate::session::{Participant, Role};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct OneFile;

    #[async_trait]
    impl SessionSource for OneFile {
        async fn load_session(&self, _id: &SessionId) -> Result<Option<SessionSeed>, StorageError> {
            Ok(Some(SessionSeed {
                files: vec![FileSeed {
                    id: "a.txt".into(),
                    name: "a.txt".into(),
                    content: "abc".into(),
                    version: 1,
                }],
                ..Default::default()
            }))
        }
    }

    #[derive(Default)]
    struct RecordingLog {
        records: Mutex<Vec<ChangeRecord>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl ChangeLog for RecordingLog {
        async fn append(&self, record: &ChangeRecord) -> Result<(), StorageError> {
            if *self.failing.lock() {
                return Err(StorageError::Io("disk full".into()));
            }
            self.records.lock().push(record.clone());
            Ok(())
        }

        async fn latest(
            &self,
            session_id: &SessionId,
            file_id: &str,
        ) -> Result<Option<ChangeRecord>, StorageError> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| &r.session_id == session_id && r.file_id == file_id)
                .max_by_key(|r| r.version)
                .cloned())
        }

        async fn get(
            &self,
            session_id: &SessionId,
            file_id: &str,
            version: u64,
        ) -> Result<Option<ChangeRecord>, StorageError> {
            Ok(self
                .records
                .lock()
                .iter()
                .find(|r| {
                    &r.session_id == session_id && r.file_id == file_id && r.version == version
                })
                .cloned())
        }
    }

    fn setup() -> (Arc<SessionRegistry>, Arc<RecordingLog>, MaintenanceScheduler) {
        let registry = Arc::new(SessionRegistry::new(Arc::new(OneFile)));
        let log = Arc::new(RecordingLog::default());
        let scheduler =
            MaintenanceScheduler::new(registry.clone(), log.clone(), MaintenanceConfig::default());
        (registry, log, scheduler)
    }

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_expiry_sweep_keeps_recent_sessions() {
        let (registry, _, scheduler) = setup();
        registry.join(&sid("s1"), Participant::new("a", "A", Role::Editor)).await.unwrap();
        let now = now_millis();

        let report = scheduler.run_expiry_sweep(now + 60 * 60 * 1000);
        assert!(report.sessions_removed.is_empty());
        assert!(registry.contains(&sid("s1")));

        let report = scheduler.run_expiry_sweep(now + 3 * 60 * 60 * 1000);
        assert_eq!(report.sessions_removed, vec![sid("s1")]);
        assert!(!registry.contains(&sid("s1")));
    }

    #[tokio::test]
    async fn test_expiry_sweep_releases_expired_locks() {
        let (registry, _, scheduler) = setup();
        let id = sid("s1");
        registry.join(&id, Participant::new("a", "A", Role::Editor)).await.unwrap();
        registry.request_lock(&id, "a.txt", "a", 1, 1, 10).unwrap();
        let mut rx = registry.subscribe();

        let report = scheduler.run_expiry_sweep(now_millis() + 11_000);

        assert_eq!(report.locks_released, 1);
        assert!(registry.snapshot(&id).unwrap().files["a.txt"].locks.is_empty());
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_durability_sweep_writes_only_changed_files() {
        let (registry, log, scheduler) = setup();
        let id = sid("s1");
        registry.join(&id, Participant::new("a", "A", Role::Editor)).await.unwrap();

        assert_eq!(scheduler.run_durability_sweep().await.written, 1);
        assert_eq!(scheduler.run_durability_sweep().await.written, 0);

        registry
            .edit_batch(&id, "a.txt", "a", vec![Operation::insert(3, "d", "a")], 1)
            .unwrap();
        assert_eq!(scheduler.run_durability_sweep().await.written, 1);

        let latest = log.latest(&id, "a.txt").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content, "abcd");
    }

    #[tokio::test]
    async fn test_durability_failure_is_retried() {
        let (registry, log, scheduler) = setup();
        registry.join(&sid("s1"), Participant::new("a", "A", Role::Editor)).await.unwrap();

        *log.failing.lock() = true;
        let report = scheduler.run_durability_sweep().await;
        assert_eq!(report, DurabilityReport { written: 0, failed: 1 });

        *log.failing.lock() = false;
        assert_eq!(scheduler.run_durability_sweep().await.written, 1);
    }

    #[tokio::test]
    async fn test_presence_sweep() {
        let (registry, _, scheduler) = setup();
        registry.join(&sid("s1"), Participant::new("a", "A", Role::Editor)).await.unwrap();

        assert_eq!(scheduler.run_presence_sweep(now_millis()), 0);
        assert_eq!(scheduler.run_presence_sweep(now_millis() + 10 * 60 * 1000), 1);
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: MaintenanceConfig =
            serde_json::from_str(r#"{"expiry_interval_secs": 5}"#).unwrap();
        assert_eq!(config.expiry_interval_secs, 5);
        assert_eq!(config.session_idle_timeout_secs, 7200);
    }
}
