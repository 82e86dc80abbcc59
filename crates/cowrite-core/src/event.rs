//! Outbound events handed to the dispatch layer for fan-out

use crate::conflict::ConflictMarker;
use crate::lock::FileLock;
use crate::operation::Operation;
use crate::session::{Cursor, Participant, Presence, SessionId, Selection};
use serde::{Deserialize, Serialize};

/// Something every other participant in the session should hear about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OutboundEvent {
    ParticipantJoined {
        participant: Participant,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        user_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CodeUpdated {
        file_id: String,
        operations: Vec<Operation>,
        version: u64,
        author: String,
    },
    #[serde(rename_all = "camelCase")]
    ConflictDetected {
        file_id: String,
        markers: Vec<ConflictMarker>,
    },
    #[serde(rename_all = "camelCase")]
    FileLocked {
        file_id: String,
        lock: FileLock,
    },
    #[serde(rename_all = "camelCase")]
    FileUnlocked {
        file_id: String,
        lock: FileLock,
    },
    #[serde(rename_all = "camelCase")]
    ConflictResolved {
        file_id: String,
        conflict_id: String,
        content: String,
        version: u64,
    },
    #[serde(rename_all = "camelCase")]
    CursorMoved {
        user_id: String,
        cursor: Cursor,
        selection: Option<Selection>,
    },
    #[serde(rename_all = "camelCase")]
    PresenceChanged {
        user_id: String,
        presence: Presence,
    },
}

/// An outbound event tagged with its session and the connection that caused it
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: SessionId,
    /// `None` for events raised by timers and sweeps
    pub origin: Option<String>,
    pub event: OutboundEvent,
}

/// Result of a mutating operation plus the events it produced
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub value: T,
    pub events: Vec<OutboundEvent>,
}

impl<T> Outcome<T> {
    pub fn new(value: T, events: Vec<OutboundEvent>) -> Self {
        Self { value, events }
    }
}
