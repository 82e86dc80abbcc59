//! Outbound responses and pushed events

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};
use cowrite_core::{
    CollaborationEvent, ConflictMarker, FileLock, MergeConflict, MergeResult, Operation,
    OutboundEvent, SessionEvent, SessionId, SessionState,
};
use serde::{Deserialize, Serialize};

/// A response frame, one JSON object per line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Full snapshot sent after `join`
    State { session: SessionState },

    #[serde(rename_all = "camelCase")]
    Applied {
        file_id: String,
        version: u64,
        operations: Vec<Operation>,
    },

    #[serde(rename_all = "camelCase")]
    Conflict {
        file_id: String,
        markers: Vec<ConflictMarker>,
    },

    #[serde(rename_all = "camelCase")]
    LockGranted { file_id: String, lock: FileLock },

    #[serde(rename_all = "camelCase")]
    LockDenied {
        file_id: String,
        conflicting: Vec<FileLock>,
    },

    #[serde(rename_all = "camelCase")]
    Resolved {
        file_id: String,
        conflict_id: String,
        version: u64,
    },

    Merged {
        content: String,
        conflicts: Vec<MergeConflict>,
        success: bool,
    },

    Events { events: Vec<CollaborationEvent> },

    Error { code: String, message: String },

    Pong,

    /// Pushed to every other connection joined to the session
    #[serde(rename_all = "camelCase")]
    Event {
        session_id: SessionId,
        payload: OutboundEvent,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok { message: None }
    }

    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok {
            message: Some(msg.into()),
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn pong() -> Self {
        Response::Pong
    }

    pub fn merged(result: MergeResult) -> Self {
        Response::Merged {
            content: result.content,
            conflicts: result.conflicts,
            success: result.success,
        }
    }

    pub fn event(event: SessionEvent) -> Self {
        Response::Event {
            session_id: event.session_id,
            payload: event.event,
        }
    }

    /// Encode the response as a single JSON line
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the response into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match serde_json::to_vec(self) {
            Ok(json) => buf.put_slice(&json),
            Err(e) => {
                let fallback = Response::error("INTERNAL", e.to_string());
                let json = serde_json::to_vec(&fallback).unwrap_or_default();
                buf.put_slice(&json);
            }
        }
        buf.put_u8(b'\n');
    }

    /// Encode without the trailing newline, for message-framed transports
    pub fn to_json(&self) -> String {
        let encoded = self.encode();
        String::from_utf8_lossy(&encoded[..encoded.len() - 1]).into_owned()
    }
}

impl From<ProtocolError> for Response {
    fn from(e: ProtocolError) -> Self {
        Response::error(e.code(), e.to_string())
    }
}

impl From<cowrite_core::Error> for Response {
    fn from(e: cowrite_core::Error) -> Self {
        Response::error(e.code(), e.to_string())
    }
}
