//! Inbound commands

use cowrite_core::{Cursor, Operation, Presence, ResolutionStrategy, Role, Selection, SessionId};
use serde::{Deserialize, Serialize};

/// Lock duration used when a request names none
pub const DEFAULT_LOCK_SECS: u64 = 300;

/// Event-log entries returned when a request names no limit
pub const DEFAULT_EVENT_LIMIT: usize = 50;

fn default_lock_secs() -> u64 {
    DEFAULT_LOCK_SECS
}

fn default_event_limit() -> usize {
    DEFAULT_EVENT_LIMIT
}

/// All supported commands, one JSON object per frame
///
/// Every command except `join`, `merge`, `ping` and `quit` acts on the
/// session the connection joined last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum Command {
    /// {"cmd":"join","sessionId":"s1","userId":"ana"}
    #[serde(rename_all = "camelCase")]
    Join {
        session_id: SessionId,
        user_id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        role: Role,
    },

    Leave,

    /// {"cmd":"edit","fileId":"main.rs","baseVersion":3,"operations":[...]}
    #[serde(rename_all = "camelCase")]
    Edit {
        file_id: String,
        base_version: u64,
        operations: Vec<Operation>,
    },

    #[serde(rename_all = "camelCase")]
    Cursor {
        cursor: Cursor,
        #[serde(default)]
        selection: Option<Selection>,
    },

    #[serde(rename_all = "camelCase")]
    Lock {
        file_id: String,
        start_line: u32,
        end_line: u32,
        #[serde(default = "default_lock_secs")]
        duration_secs: u64,
    },

    #[serde(rename_all = "camelCase")]
    Unlock {
        file_id: String,
        start_line: u32,
        end_line: u32,
    },

    #[serde(rename_all = "camelCase")]
    Resolve {
        file_id: String,
        conflict_id: String,
        strategy: ResolutionStrategy,
        #[serde(default)]
        merged_content: Option<String>,
    },

    /// Stateless three-way merge
    Merge {
        base: String,
        #[serde(default)]
        theirs: Vec<Operation>,
        #[serde(default)]
        mine: Vec<Operation>,
    },

    Presence {
        presence: Presence,
    },

    Events {
        #[serde(default = "default_event_limit")]
        limit: usize,
    },

    Ping,

    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Join { .. } => "join",
            Command::Leave => "leave",
            Command::Edit { .. } => "edit",
            Command::Cursor { .. } => "cursor",
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::Resolve { .. } => "resolve",
            Command::Merge { .. } => "merge",
            Command::Presence { .. } => "presence",
            Command::Events { .. } => "events",
            Command::Ping => "ping",
            Command::Quit => "quit",
        }
    }

    /// Whether the command needs a joined session
    pub fn requires_session(&self) -> bool {
        !matches!(
            self,
            Command::Join { .. } | Command::Merge { .. } | Command::Ping | Command::Quit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::OpKind;

    #[test]
    fn test_join_defaults() {
        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"join","sessionId":"s1","userId":"ana"}"#).unwrap();

        match cmd {
            Command::Join { session_id, user_id, name, role } => {
                assert_eq!(session_id.as_str(), "s1");
                assert_eq!(user_id, "ana");
                assert!(name.is_none());
                assert_eq!(role, Role::Editor);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_join_rejects_bad_session_id() {
        let result =
            serde_json::from_str::<Command>(r#"{"cmd":"join","sessionId":"a b","userId":"ana"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_edit_operations() {
        let cmd: Command = serde_json::from_str(
            r#"{"cmd":"edit","fileId":"f","baseVersion":2,
                "operations":[{"type":"insert","position":0,"text":"hi"},
                              {"type":"delete","position":4,"length":2}]}"#,
        )
        .unwrap();

        match cmd {
            Command::Edit { operations, base_version, .. } => {
                assert_eq!(base_version, 2);
                assert_eq!(operations[0].kind, OpKind::Insert);
                assert_eq!(operations[1].length, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lock_default_duration() {
        let json = r#"{"cmd":"lock","fileId":"f","startLine":1,"endLine":4}"#;
        let cmd: Command = serde_json::from_str(json).unwrap();
        assert!(matches!(cmd, Command::Lock { duration_secs: DEFAULT_LOCK_SECS, .. }));
    }

    #[test]
    fn test_requires_session() {
        assert!(Command::Leave.requires_session());
        assert!(!Command::Ping.requires_session());
        assert_eq!(Command::Events { limit: 1 }.name(), "events");
    }
}
