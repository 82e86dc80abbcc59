//! Per-session collaboration state
//!
//! A [`SessionState`] is a plain owned struct: participants, files (with
//! their conflict markers, locks and revision history) and a bounded event
//! log. It knows nothing about locking or timers; the registry wraps each
//! one in its own mutex.

use crate::conflict::ConflictMarker;
use crate::error::{Error, Result};
use crate::event::{Outcome, OutboundEvent};
use crate::lock::{FileLock, LockTable};
use crate::operation::Operation;
use crate::persistence::{FileSeed, SessionSeed};
use crate::resolve::{self, ResolutionStrategy};
use crate::transform::{self, BatchOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

/// Capacity of the per-session event log
pub const MAX_EVENT_LOG: usize = 1000;

/// Committed revisions retained per file for rebasing stale batches
pub const MAX_REVISION_HISTORY: usize = 512;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Session identifier - UTF-8 string, max 256 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Create a new session ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidSessionId("Session ID cannot be empty".into()));
        }

        if id.len() > 256 {
            return Err(Error::InvalidSessionId("Session ID exceeds 256 bytes".into()));
        }

        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-') {
            return Err(Error::InvalidSessionId(
                "Session ID must match pattern [a-zA-Z0-9:_-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Owner,
    #[default]
    Editor,
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    #[default]
    Active,
    Idle,
    Away,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub file_id: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub presence: Presence,
    #[serde(default)]
    pub last_activity: u64,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub selection: Option<Selection>,
}

impl Participant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            presence: Presence::Active,
            last_activity: 0,
            cursor: None,
            selection: None,
        }
    }

    fn touch(&mut self, now: u64) {
        self.last_activity = now;
        self.presence = Presence::Active;
    }
}

/// One accepted batch (or content-changing resolution)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    /// Version the file reached with this revision
    pub version: u64,
    pub author: String,
    /// Operations as applied, sequentially
    pub operations: Vec<Operation>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub id: String,
    pub name: String,
    pub content: String,
    pub version: u64,
    pub last_modified: u64,
    pub last_modified_by: Option<String>,
    pub conflicts: Vec<ConflictMarker>,
    pub locks: LockTable,
    #[serde(skip)]
    history: VecDeque<Revision>,
}

impl FileState {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        version: u64,
        now: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            content: content.into(),
            version,
            last_modified: now,
            last_modified_by: None,
            conflicts: Vec::new(),
            locks: LockTable::new(),
            history: VecDeque::new(),
        }
    }

    fn from_seed(seed: FileSeed, now: u64) -> Self {
        Self::new(seed.id, seed.name, seed.content, seed.version, now)
    }

    /// Operations committed after `base`, in commit order
    ///
    /// `None` when `base` is ahead of the file or older than the retained
    /// history.
    pub fn concurrent_since(&self, base: u64) -> Option<Vec<Operation>> {
        if base > self.version {
            return None;
        }
        if base == self.version {
            return Some(Vec::new());
        }

        let oldest = self.history.front()?.version;
        if oldest > base + 1 {
            return None;
        }

        Some(
            self.history
                .iter()
                .filter(|rev| rev.version > base)
                .flat_map(|rev| rev.operations.iter().cloned())
                .collect(),
        )
    }

    /// Retained revisions newer than `version`
    pub fn revisions_after(&self, version: u64) -> impl Iterator<Item = &Revision> {
        self.history.iter().filter(move |rev| rev.version > version)
    }

    /// Install new content and bump the version by exactly one
    pub(crate) fn commit(
        &mut self,
        author: &str,
        operations: Vec<Operation>,
        content: String,
        now: u64,
    ) -> u64 {
        self.content = content;
        self.version += 1;
        self.last_modified = now;
        self.last_modified_by = Some(author.to_string());

        self.history.push_back(Revision {
            version: self.version,
            author: author.to_string(),
            operations,
            timestamp: now,
        });
        while self.history.len() > MAX_REVISION_HISTORY {
            self.history.pop_front();
        }

        self.version
    }

    pub fn unresolved_conflicts(&self) -> Vec<ConflictMarker> {
        self.conflicts.iter().filter(|m| !m.resolved).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Join,
    Leave,
    Edit,
    Cursor,
    Selection,
}

/// Entry in the bounded session event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationEvent {
    pub id: String,
    pub kind: EventKind,
    pub actor: String,
    pub session_id: SessionId,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

/// Authoritative state of one collaboration session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub id: SessionId,
    pub team_id: Option<String>,
    pub participants: HashMap<String, Participant>,
    pub files: HashMap<String, FileState>,
    /// file id -> user id of the last author to edit it
    pub active_editors: HashMap<String, String>,
    pub events: VecDeque<CollaborationEvent>,
    pub created_at: u64,
    /// Last mutation of any kind
    pub touched_at: u64,
    #[serde(skip)]
    roster: HashMap<String, Role>,
    /// Open connections per participant
    #[serde(skip)]
    connections: HashMap<String, usize>,
}

impl SessionState {
    pub fn new(id: SessionId, now: u64) -> Self {
        Self {
            id,
            team_id: None,
            participants: HashMap::new(),
            files: HashMap::new(),
            active_editors: HashMap::new(),
            events: VecDeque::new(),
            created_at: now,
            touched_at: now,
            roster: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    pub fn from_seed(id: SessionId, seed: SessionSeed, now: u64) -> Self {
        let mut state = Self::new(id, now);
        state.team_id = seed.team_id;
        state.roster = seed.roster.into_iter().map(|entry| (entry.user_id, entry.role)).collect();
        state.files = seed
            .files
            .into_iter()
            .map(|file| (file.id.clone(), FileState::from_seed(file, now)))
            .collect();
        state
    }

    /// Most recent activity of any participant, or of the session itself
    /// once everyone has left
    pub fn last_activity(&self) -> u64 {
        self.participants
            .values()
            .map(|p| p.last_activity)
            .max()
            .unwrap_or(self.touched_at)
    }

    pub fn file(&self, file_id: &str) -> Result<&FileState> {
        self.files
            .get(file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    fn file_mut(&mut self, file_id: &str) -> Result<&mut FileState> {
        self.files
            .get_mut(file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    fn participant_mut(&mut self, user_id: &str) -> Result<&mut Participant> {
        self.participants
            .get_mut(user_id)
            .ok_or_else(|| Error::ParticipantNotFound(user_id.to_string()))
    }

    fn touch(&mut self, user_id: &str, now: u64) -> Result<()> {
        self.participant_mut(user_id)?.touch(now);
        self.touched_at = now;
        Ok(())
    }

    fn log(&mut self, kind: EventKind, actor: &str, payload: serde_json::Value, now: u64) {
        self.events.push_back(CollaborationEvent {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            actor: actor.to_string(),
            session_id: self.id.clone(),
            timestamp: now,
            payload,
        });
        while self.events.len() > MAX_EVENT_LOG {
            self.events.pop_front();
        }
    }

    /// Most recent `limit` log entries, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<CollaborationEvent> {
        let skip = self.events.len().saturating_sub(limit);
        self.events.iter().skip(skip).cloned().collect()
    }

    /// Add or replace a participant
    pub fn join(&mut self, mut participant: Participant, now: u64) -> Vec<OutboundEvent> {
        if let Some(role) = self.roster.get(&participant.id) {
            participant.role = *role;
        }
        participant.touch(now);
        self.touched_at = now;
        *self.connections.entry(participant.id.clone()).or_insert(0) += 1;

        self.log(
            EventKind::Join,
            &participant.id,
            serde_json::json!({ "name": participant.name, "role": participant.role }),
            now,
        );
        self.participants.insert(participant.id.clone(), participant.clone());

        vec![OutboundEvent::ParticipantJoined { participant }]
    }

    /// Drop one of a participant's connections; the last one out removes
    /// the participant and releases their locks and editor slots
    ///
    /// Leaving twice is harmless.
    pub fn leave(&mut self, user_id: &str, now: u64) -> Vec<OutboundEvent> {
        if let Some(count) = self.connections.get_mut(user_id) {
            if *count > 1 {
                *count -= 1;
                return Vec::new();
            }
        }
        self.connections.remove(user_id);

        let mut events = Vec::new();

        let was_present = self.participants.remove(user_id).is_some();
        self.active_editors.retain(|_, editor| editor != user_id);
        self.touched_at = now;

        for file in self.files.values_mut() {
            for lock in file.locks.release_all(user_id) {
                events.push(OutboundEvent::FileUnlocked {
                    file_id: file.id.clone(),
                    lock,
                });
            }
        }

        if was_present {
            self.log(EventKind::Leave, user_id, serde_json::Value::Null, now);
            events.insert(0, OutboundEvent::ParticipantLeft { user_id: user_id.to_string() });
        }

        events
    }

    pub fn set_presence(
        &mut self,
        user_id: &str,
        presence: Presence,
        now: u64,
    ) -> Result<OutboundEvent> {
        let participant = self.participant_mut(user_id)?;
        participant.presence = presence;
        participant.last_activity = now;
        self.touched_at = now;

        Ok(OutboundEvent::PresenceChanged {
            user_id: user_id.to_string(),
            presence,
        })
    }

    pub fn update_cursor(
        &mut self,
        user_id: &str,
        cursor: Cursor,
        selection: Option<Selection>,
        now: u64,
    ) -> Result<OutboundEvent> {
        self.file(&cursor.file_id)?;
        self.touch(user_id, now)?;

        let participant = self.participant_mut(user_id)?;
        participant.cursor = Some(cursor.clone());
        participant.selection = selection.clone();

        self.log(
            EventKind::Cursor,
            user_id,
            serde_json::json!({
                "fileId": cursor.file_id,
                "line": cursor.line,
                "column": cursor.column,
            }),
            now,
        );
        if let Some(sel) = &selection {
            self.log(
                EventKind::Selection,
                user_id,
                serde_json::to_value(sel).unwrap_or_default(),
                now,
            );
        }

        Ok(OutboundEvent::CursorMoved {
            user_id: user_id.to_string(),
            cursor,
            selection,
        })
    }

    /// Run a batch through the transform pipeline
    pub fn edit(
        &mut self,
        user_id: &str,
        file_id: &str,
        operations: Vec<Operation>,
        base_version: u64,
        now: u64,
    ) -> Result<Outcome<BatchOutcome>> {
        self.touch(user_id, now)?;
        let file = self.file_mut(file_id)?;
        let outcome = transform::apply_batch(file, user_id, operations, base_version, now)?;

        let event = match &outcome {
            BatchOutcome::Applied { version, operations } => {
                let event = OutboundEvent::CodeUpdated {
                    file_id: file_id.to_string(),
                    operations: operations.clone(),
                    version: *version,
                    author: user_id.to_string(),
                };
                self.active_editors.insert(file_id.to_string(), user_id.to_string());
                self.log(
                    EventKind::Edit,
                    user_id,
                    serde_json::json!({
                        "fileId": file_id,
                        "version": version,
                        "operations": operations,
                    }),
                    now,
                );
                event
            }
            BatchOutcome::Conflict { markers } => OutboundEvent::ConflictDetected {
                file_id: file_id.to_string(),
                markers: markers.clone(),
            },
        };

        Ok(Outcome::new(outcome, vec![event]))
    }

    pub fn request_lock(
        &mut self,
        user_id: &str,
        file_id: &str,
        start_line: u32,
        end_line: u32,
        duration_secs: u64,
        now: u64,
    ) -> Result<Outcome<FileLock>> {
        self.touch(user_id, now)?;
        let file = self.file_mut(file_id)?;
        let (lock, expired) =
            file.locks.request(user_id, start_line, end_line, duration_secs, now)?;

        let mut events: Vec<OutboundEvent> = expired
            .into_iter()
            .map(|lock| OutboundEvent::FileUnlocked {
                file_id: file_id.to_string(),
                lock,
            })
            .collect();
        events.push(OutboundEvent::FileLocked {
            file_id: file_id.to_string(),
            lock: lock.clone(),
        });

        Ok(Outcome::new(lock, events))
    }

    /// Release a lock; absent locks are a no-op
    pub fn release_lock(
        &mut self,
        user_id: &str,
        file_id: &str,
        start_line: u32,
        end_line: u32,
        now: u64,
    ) -> Result<Outcome<Option<FileLock>>> {
        let file = self.file_mut(file_id)?;
        let released = file.locks.release(user_id, start_line, end_line);
        self.touched_at = now;

        let events = released
            .iter()
            .map(|lock| OutboundEvent::FileUnlocked {
                file_id: file_id.to_string(),
                lock: lock.clone(),
            })
            .collect();

        Ok(Outcome::new(released, events))
    }

    /// Drop a lock whose timer fired
    pub fn expire_lock(&mut self, file_id: &str, lock_id: &str) -> Option<FileLock> {
        self.files.get_mut(file_id)?.locks.release_by_id(lock_id)
    }

    pub fn resolve_conflict(
        &mut self,
        user_id: &str,
        file_id: &str,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged_content: Option<String>,
        now: u64,
    ) -> Result<Outcome<u64>> {
        self.touch(user_id, now)?;
        let file = self.file_mut(file_id)?;
        let version =
            resolve::resolve_conflict(file, conflict_id, strategy, merged_content, user_id, now)?;

        let event = OutboundEvent::ConflictResolved {
            file_id: file_id.to_string(),
            conflict_id: conflict_id.to_string(),
            content: file.content.clone(),
            version,
        };

        Ok(Outcome::new(version, vec![event]))
    }

    /// Demote quiet participants: idle after `idle_after_ms`, away after
    /// `away_after_ms`. Offline participants are left alone.
    pub fn age_presence(
        &mut self,
        now: u64,
        idle_after_ms: u64,
        away_after_ms: u64,
    ) -> Vec<OutboundEvent> {
        let mut events = Vec::new();

        for participant in self.participants.values_mut() {
            if participant.presence == Presence::Offline {
                continue;
            }

            let quiet_for = now.saturating_sub(participant.last_activity);
            let next = if quiet_for > away_after_ms {
                Presence::Away
            } else if quiet_for > idle_after_ms {
                Presence::Idle
            } else {
                participant.presence
            };

            if next != participant.presence {
                participant.presence = next;
                events.push(OutboundEvent::PresenceChanged {
                    user_id: participant.id.clone(),
                    presence: next,
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::RosterEntry;

    fn session() -> SessionState {
        let seed = SessionSeed {
            team_id: Some("team-1".into()),
            roster: vec![RosterEntry {
                user_id: "owner".into(),
                role: Role::Owner,
            }],
            files: vec![FileSeed {
                id: "main.rs".into(),
                name: "main.rs".into(),
                content: "hello world".into(),
                version: 1,
            }],
        };
        SessionState::from_seed(SessionId::new("s1").unwrap(), seed, 0)
    }

    #[test]
    fn test_session_id_valid() {
        assert!(SessionId::new("session:123").is_ok());
        assert!(SessionId::new("team_a-42").is_ok());
    }

    #[test]
    fn test_session_id_invalid() {
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("a/b").is_err());
        assert!(SessionId::new("a".repeat(257)).is_err());
    }

    #[test]
    fn test_join_applies_roster_role() {
        let mut state = session();
        let events = state.join(Participant::new("owner", "Olivia", Role::Viewer), 10);

        assert_eq!(state.participants["owner"].role, Role::Owner);
        assert_eq!(state.participants["owner"].last_activity, 10);
        assert!(matches!(events[0], OutboundEvent::ParticipantJoined { .. }));
        assert_eq!(state.events.len(), 1);
    }

    #[test]
    fn test_leave_releases_locks_and_editor_slots() {
        let mut state = session();
        state.join(Participant::new("alice", "Alice", Role::Editor), 0);
        state.request_lock("alice", "main.rs", 1, 3, 60, 0).unwrap();
        state.edit("alice", "main.rs", vec![Operation::insert(0, "x", "alice")], 1, 0).unwrap();
        assert_eq!(state.active_editors.get("main.rs").map(String::as_str), Some("alice"));

        let events = state.leave("alice", 5);

        assert!(state.participants.is_empty());
        assert!(state.active_editors.is_empty());
        assert!(state.files["main.rs"].locks.is_empty());
        assert!(matches!(events[0], OutboundEvent::ParticipantLeft { .. }));
        assert!(matches!(events[1], OutboundEvent::FileUnlocked { .. }));

        assert!(state.leave("alice", 6).is_empty());
    }

    #[test]
    fn test_leave_waits_for_last_connection() {
        let mut state = session();
        state.join(Participant::new("alice", "Alice", Role::Editor), 0);
        state.join(Participant::new("alice", "Alice", Role::Editor), 1);
        state.request_lock("alice", "main.rs", 1, 3, 60, 1).unwrap();

        assert!(state.leave("alice", 2).is_empty());
        assert!(state.participants.contains_key("alice"));
        assert_eq!(state.files["main.rs"].locks.len(), 1);

        let events = state.leave("alice", 3);
        assert!(matches!(events[0], OutboundEvent::ParticipantLeft { .. }));
        assert!(state.participants.is_empty());
    }

    #[test]
    fn test_event_log_is_bounded() {
        let mut state = session();
        for i in 0..(MAX_EVENT_LOG + 25) {
            state.join(Participant::new(format!("u{}", i), "U", Role::Editor), i as u64);
        }

        assert_eq!(state.events.len(), MAX_EVENT_LOG);
        assert_eq!(state.events.front().map(|e| e.actor.as_str()), Some("u25"));
        assert_eq!(state.recent_events(3).len(), 3);
    }

    #[test]
    fn test_cursor_update_requires_known_file() {
        let mut state = session();
        state.join(Participant::new("alice", "Alice", Role::Editor), 0);

        let cursor = Cursor { file_id: "nope.rs".into(), line: 1, column: 1 };
        assert!(matches!(
            state.update_cursor("alice", cursor, None, 1),
            Err(Error::FileNotFound(_))
        ));

        let cursor = Cursor { file_id: "main.rs".into(), line: 1, column: 3 };
        let selection = Selection { start_line: 1, start_column: 1, end_line: 1, end_column: 3 };
        let event = state.update_cursor("alice", cursor, Some(selection), 2).unwrap();
        assert!(matches!(event, OutboundEvent::CursorMoved { selection: Some(_), .. }));
        // cursor + selection
        assert_eq!(state.events.len(), 3);
    }

    #[test]
    fn test_presence_aging() {
        let mut state = session();
        state.join(Participant::new("fresh", "F", Role::Editor), 10 * 60_000);
        state.join(Participant::new("idle", "I", Role::Editor), 7 * 60_000);
        state.join(Participant::new("away", "A", Role::Editor), 0);
        state.join(Participant::new("gone", "G", Role::Editor), 0);
        state.set_presence("gone", Presence::Offline, 0).unwrap();

        let events = state.age_presence(10 * 60_000, 2 * 60_000, 5 * 60_000);

        assert_eq!(state.participants["fresh"].presence, Presence::Active);
        assert_eq!(state.participants["idle"].presence, Presence::Idle);
        assert_eq!(state.participants["away"].presence, Presence::Away);
        assert_eq!(state.participants["gone"].presence, Presence::Offline);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_last_activity_falls_back_to_session() {
        let mut state = session();
        state.join(Participant::new("alice", "Alice", Role::Editor), 100);
        assert_eq!(state.last_activity(), 100);

        state.leave("alice", 200);
        assert_eq!(state.last_activity(), 200);
    }

    #[test]
    fn test_edit_requires_participant() {
        let mut state = session();
        let result = state.edit("ghost", "main.rs", vec![Operation::insert(0, "x", "ghost")], 1, 0);
        assert!(matches!(result, Err(Error::ParticipantNotFound(_))));
    }
}
