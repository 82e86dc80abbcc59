//! Session registry - owns every live session and serializes access to each
//!
//! One mutex per session: every mutation of a session (edit, lock, resolve,
//! join/leave, sweep) holds that session's mutex and nothing else. Sessions
//! never share state, so different sessions proceed in parallel. No external
//! I/O happens while a session mutex is held.
//!
//! A session leaving the map is retired under its own mutex, so a command
//! that looked the session up just before it was dropped fails instead of
//! mutating a detached copy.

use crate::error::{Error, Result};
use crate::event::{Outcome, OutboundEvent, SessionEvent};
use crate::lock::FileLock;
use crate::operation::Operation;
use crate::persistence::{ChangeRecord, SessionSource};
use crate::resolve::ResolutionStrategy;
use crate::session::{
    now_millis, CollaborationEvent, Cursor, Participant, Presence, Selection, SessionId,
    SessionState,
};
use crate::transform::BatchOutcome;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Capacity of the registry broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 10000;

struct SessionHandle {
    state: Mutex<SessionState>,
    /// Pending lock auto-release tasks, by lock id
    timers: Mutex<HashMap<String, AbortHandle>>,
    /// Set under the state mutex once the session has left the map
    retired: AtomicBool,
}

impl SessionHandle {
    fn new(state: SessionState) -> Self {
        Self {
            state: Mutex::new(state),
            timers: Mutex::new(HashMap::new()),
            retired: AtomicBool::new(false),
        }
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    fn cancel_timer(&self, lock_id: &str) {
        if let Some(timer) = self.timers.lock().remove(lock_id) {
            timer.abort();
        }
    }

    fn cancel_all_timers(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.abort();
        }
    }

    /// Cancel the timers of every lock an event list reports as released
    fn cancel_released(&self, events: &[OutboundEvent]) {
        for event in events {
            if let OutboundEvent::FileUnlocked { lock, .. } = event {
                self.cancel_timer(&lock.id);
            }
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub session_count: usize,
    pub participant_count: usize,
    pub subscriber_count: usize,
}

/// Owns the authoritative session -> state map
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    source: Arc<dyn SessionSource>,
    /// Events raised without a caller (timers, sweeps) plus whatever the
    /// dispatch layer publishes
    event_sender: broadcast::Sender<SessionEvent>,
}

impl SessionRegistry {
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            sessions: DashMap::new(),
            source,
            event_sender,
        }
    }

    /// Load a session from the metadata store unless it is already live
    ///
    /// Concurrent first calls for the same id each load, but only the first
    /// insert wins. A failed load creates nothing.
    pub async fn initialize(&self, id: &SessionId) -> Result<()> {
        if self.sessions.contains_key(id) {
            return Ok(());
        }

        let seed = self
            .source
            .load_session(id)
            .await
            .map_err(|e| {
                warn!(session = %id, error = %e, "Failed to load session");
                Error::from(e)
            })?
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;

        let state = SessionState::from_seed(id.clone(), seed, now_millis());
        if let Entry::Vacant(entry) = self.sessions.entry(id.clone()) {
            info!(session = %id, files = state.files.len(), "Session initialized");
            entry.insert(Arc::new(SessionHandle::new(state)));
        }

        Ok(())
    }

    fn handle(&self, id: &SessionId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))
    }

    /// Run `f` under the session mutex, unless the session was retired
    fn locked<T>(
        id: &SessionId,
        handle: &Arc<SessionHandle>,
        f: impl FnOnce(&mut SessionState, u64) -> Result<T>,
    ) -> Result<T> {
        let mut state = handle.state.lock();
        if handle.is_retired() {
            return Err(Error::SessionNotFound(id.to_string()));
        }
        f(&mut state, now_millis())
    }

    fn with_state<T>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionState, u64) -> Result<T>,
    ) -> Result<T> {
        let handle = self.handle(id)?;
        Self::locked(id, &handle, f)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Join a session, initializing it on first use; returns a full snapshot
    ///
    /// If the session is expired between initialization and the join, it is
    /// loaded again.
    pub async fn join(
        &self,
        id: &SessionId,
        participant: Participant,
    ) -> Result<Outcome<SessionState>> {
        let user = participant.id.clone();

        let outcome = loop {
            self.initialize(id).await?;

            let handle = match self.handle(id) {
                Ok(handle) => handle,
                Err(Error::SessionNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let joining = participant.clone();
            let result = Self::locked(id, &handle, |state, now| {
                let events = state.join(joining, now);
                Ok(Outcome::new(state.clone(), events))
            });
            match result {
                Err(Error::SessionNotFound(_)) => continue,
                result => break result?,
            }
        };

        debug!(session = %id, user = %user, "Participant joined");
        Ok(outcome)
    }

    /// Leave a session; releases the user's locks and editor slots
    pub fn leave(&self, id: &SessionId, user_id: &str) -> Result<Outcome<()>> {
        let handle = self.handle(id)?;
        let events = Self::locked(id, &handle, |state, now| Ok(state.leave(user_id, now)))?;
        handle.cancel_released(&events);

        debug!(
            session = %id,
            user = user_id,
            released = events.len().saturating_sub(1),
            "Participant left"
        );
        Ok(Outcome::new((), events))
    }

    pub fn presence(
        &self,
        id: &SessionId,
        user_id: &str,
        presence: Presence,
    ) -> Result<Outcome<()>> {
        self.with_state(id, |state, now| {
            let event = state.set_presence(user_id, presence, now)?;
            Ok(Outcome::new((), vec![event]))
        })
    }

    pub fn cursor_update(
        &self,
        id: &SessionId,
        user_id: &str,
        cursor: Cursor,
        selection: Option<Selection>,
    ) -> Result<Outcome<()>> {
        self.with_state(id, |state, now| {
            let event = state.update_cursor(user_id, cursor, selection, now)?;
            Ok(Outcome::new((), vec![event]))
        })
    }

    pub fn edit_batch(
        &self,
        id: &SessionId,
        file_id: &str,
        user_id: &str,
        operations: Vec<Operation>,
        base_version: u64,
    ) -> Result<Outcome<BatchOutcome>> {
        self.with_state(id, |state, now| {
            state.edit(user_id, file_id, operations, base_version, now)
        })
    }

    /// Request an advisory lock; never waits
    ///
    /// On success the lock is released automatically once its duration
    /// elapses (when a tokio runtime is available) and a `file-unlocked`
    /// event is published on the registry channel.
    pub fn request_lock(
        &self,
        id: &SessionId,
        file_id: &str,
        user_id: &str,
        start_line: u32,
        end_line: u32,
        duration_secs: u64,
    ) -> Result<Outcome<FileLock>> {
        let handle = self.handle(id)?;
        let result = Self::locked(id, &handle, |state, now| {
            state.request_lock(user_id, file_id, start_line, end_line, duration_secs, now)
        });

        match result {
            Ok(outcome) => {
                handle.cancel_released(&outcome.events);
                self.schedule_release(id, &handle, file_id, &outcome.value);
                debug!(
                    session = %id,
                    file = file_id,
                    user = user_id,
                    start_line,
                    end_line,
                    "Lock granted"
                );
                Ok(outcome)
            }
            Err(e) => {
                debug!(
                    session = %id,
                    file = file_id,
                    user = user_id,
                    start_line,
                    end_line,
                    error = %e,
                    "Lock denied"
                );
                Err(e)
            }
        }
    }

    /// Release a lock; releasing an absent lock is a no-op
    pub fn release_lock(
        &self,
        id: &SessionId,
        file_id: &str,
        user_id: &str,
        start_line: u32,
        end_line: u32,
    ) -> Result<Outcome<Option<FileLock>>> {
        let handle = self.handle(id)?;
        let outcome = Self::locked(id, &handle, |state, now| {
            state.release_lock(user_id, file_id, start_line, end_line, now)
        })?;

        if let Some(lock) = &outcome.value {
            handle.cancel_timer(&lock.id);
        }
        Ok(outcome)
    }

    pub fn resolve_conflict(
        &self,
        id: &SessionId,
        file_id: &str,
        user_id: &str,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged_content: Option<String>,
    ) -> Result<Outcome<u64>> {
        self.with_state(id, |state, now| {
            state.resolve_conflict(user_id, file_id, conflict_id, strategy, merged_content, now)
        })
    }

    /// Drop a session, e.g. after it was deleted upstream
    pub fn remove(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove_if(id, |_, handle| {
            let _state = handle.state.lock();
            handle.retire();
            true
        });

        match removed {
            Some((_, handle)) => {
                handle.cancel_all_timers();
                info!(session = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self, id: &SessionId) -> Result<SessionState> {
        self.with_state(id, |state, _| Ok(state.clone()))
    }

    pub fn events(&self, id: &SessionId, limit: usize) -> Result<Vec<CollaborationEvent>> {
        self.with_state(id, |state, _| Ok(state.recent_events(limit)))
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Remove sessions whose most recent activity is older than `idle_timeout_ms`
    ///
    /// The idle check and the removal happen under the session mutex, so an
    /// edit or join racing the sweep either lands first and keeps the
    /// session alive, or finds it gone.
    pub fn expire_idle(&self, now: u64, idle_timeout_ms: u64) -> Vec<SessionId> {
        let mut expired = Vec::new();

        for id in self.session_ids() {
            let mut idle_ms = 0;
            let removed = self.sessions.remove_if(&id, |_, handle| {
                let state = handle.state.lock();
                idle_ms = now.saturating_sub(state.last_activity());
                let idle = idle_ms > idle_timeout_ms;
                if idle {
                    handle.retire();
                }
                idle
            });

            if let Some((_, handle)) = removed {
                handle.cancel_all_timers();
                debug!(session = %id, idle_ms, "Session expired");
                expired.push(id);
            }
        }

        expired
    }

    /// Drop expired locks everywhere and publish the releases
    pub fn purge_expired_locks(&self, now: u64) -> usize {
        let mut purged = 0;

        for id in self.session_ids() {
            let Ok(handle) = self.handle(&id) else { continue };
            let events: Vec<OutboundEvent> = {
                let mut state = handle.state.lock();
                state
                    .files
                    .values_mut()
                    .flat_map(|file| {
                        let file_id = file.id.clone();
                        file.locks
                            .purge_expired(now)
                            .into_iter()
                            .map(move |lock| OutboundEvent::FileUnlocked {
                                file_id: file_id.clone(),
                                lock,
                            })
                    })
                    .collect()
            };

            handle.cancel_released(&events);
            purged += events.len();
            self.publish(&id, None, events);
        }

        purged
    }

    /// Age presence in every session and publish the changes
    pub fn age_presence(&self, now: u64, idle_after_ms: u64, away_after_ms: u64) -> usize {
        let mut changed = 0;

        for id in self.session_ids() {
            let Ok(handle) = self.handle(&id) else { continue };
            let events = handle
                .state
                .lock()
                .age_presence(now, idle_after_ms, away_after_ms);
            changed += events.len();
            self.publish(&id, None, events);
        }

        changed
    }

    /// Snapshot every file whose version moved past what `flushed` reports
    ///
    /// Each session is locked only while its files are copied.
    pub fn file_snapshots(
        &self,
        flushed: impl Fn(&SessionId, &str) -> Option<u64>,
    ) -> Vec<ChangeRecord> {
        let mut records = Vec::new();

        for id in self.session_ids() {
            let Ok(handle) = self.handle(&id) else { continue };
            let state = handle.state.lock();

            for file in state.files.values() {
                let since = flushed(&id, &file.id);
                if since.is_some_and(|v| v >= file.version) {
                    continue;
                }

                records.push(ChangeRecord {
                    session_id: id.clone(),
                    file_id: file.id.clone(),
                    version: file.version,
                    content: file.content.clone(),
                    operations: file
                        .revisions_after(since.unwrap_or(0))
                        .flat_map(|rev| rev.operations.iter().cloned())
                        .collect(),
                    author: file.last_modified_by.clone(),
                    timestamp: file.last_modified,
                });
            }
        }

        records
    }

    /// Subscribe to events for every session
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Fan events out to subscribers
    pub fn publish(
        &self,
        session_id: &SessionId,
        origin: Option<&str>,
        events: Vec<OutboundEvent>,
    ) {
        for event in events {
            let _ = self.event_sender.send(SessionEvent {
                session_id: session_id.clone(),
                origin: origin.map(str::to_string),
                event,
            });
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let participant_count = self
            .sessions
            .iter()
            .map(|entry| entry.value().state.lock().participants.len())
            .sum();

        RegistryStats {
            session_count: self.sessions.len(),
            participant_count,
            subscriber_count: self.event_sender.receiver_count(),
        }
    }

    fn schedule_release(
        &self,
        session_id: &SessionId,
        handle: &Arc<SessionHandle>,
        file_id: &str,
        lock: &FileLock,
    ) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(session = %session_id, lock = %lock.id, "No runtime, lock will expire lazily");
            return;
        };

        let weak = Arc::downgrade(handle);
        let sender = self.event_sender.clone();
        let session_id = session_id.clone();
        let file_id = file_id.to_string();
        let lock_id = lock.id.clone();
        let delay = Duration::from_secs(lock.duration_secs);

        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(handle) = weak.upgrade() else { return };
            let released = Self::locked(&session_id, &handle, |state, _| {
                Ok(state.expire_lock(&file_id, &lock_id))
            });
            handle.timers.lock().remove(&lock_id);

            if let Ok(Some(lock)) = released {
                debug!(
                    session = %session_id,
                    file = %file_id,
                    lock = %lock.id,
                    "Lock auto-released"
                );
                let _ = sender.send(SessionEvent {
                    session_id,
                    origin: None,
                    event: OutboundEvent::FileUnlocked { file_id, lock },
                });
            }
        });

        handle.timers.lock().insert(lock.id.clone(), task.abort_handle());
    }
}
