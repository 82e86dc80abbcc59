//! Connection handler - dispatches commands to the session registry

use cowrite_core::{
    now_millis, three_way_merge, BatchOutcome, Error as CoreError, OutboundEvent, Participant,
    SessionEvent, SessionId, SessionRegistry,
};
use cowrite_protocol::{parse_frame, Command, Parser, ProtocolError, ProtocolResult, Response};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The session and user a connection joined as
#[derive(Debug, Clone)]
struct Membership {
    session_id: SessionId,
    user_id: String,
}

/// Handles a single client connection
///
/// Transport agnostic: TCP feeds it raw bytes through [`process`], the
/// WebSocket server feeds it whole frames through [`process_frame`].
///
/// [`process`]: ConnectionHandler::process
/// [`process_frame`]: ConnectionHandler::process_frame
pub struct ConnectionHandler {
    /// Unique client ID, used as the origin of events this connection causes
    pub client_id: String,
    registry: Arc<SessionRegistry>,
    parser: Parser,
    joined: Option<Membership>,
    closing: bool,
}

impl ConnectionHandler {
    pub fn new(client_id: String, registry: Arc<SessionRegistry>) -> Self {
        Self {
            client_id,
            registry,
            parser: Parser::new(),
            joined: None,
            closing: false,
        }
    }

    /// Process incoming bytes and return responses
    pub async fn process(&mut self, data: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        if let Err(e) = self.parser.feed(data) {
            responses.push(e.into());
            return responses;
        }

        loop {
            match self.parser.parse() {
                Ok(Some(cmd)) => {
                    responses.push(self.handle_command(cmd).await);
                    if self.closing {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => responses.push(e.into()),
            }
        }

        responses
    }

    /// Process one complete frame
    pub async fn process_frame(&mut self, text: &str) -> Response {
        match parse_frame(text.trim()) {
            Ok(cmd) => self.handle_command(cmd).await,
            Err(e) => e.into(),
        }
    }

    /// Handle a single command
    pub async fn handle_command(&mut self, cmd: Command) -> Response {
        debug!(client = %self.client_id, cmd = cmd.name(), "Processing command");

        match self.dispatch(cmd).await {
            Ok(response) => response,
            Err(e) => {
                debug!(client = %self.client_id, code = e.code(), error = %e, "Command failed");
                e.into()
            }
        }
    }

    async fn dispatch(&mut self, cmd: Command) -> ProtocolResult<Response> {
        let member = match (&self.joined, cmd.requires_session()) {
            (Some(m), _) => Some(m.clone()),
            (None, true) => return Err(ProtocolError::NotJoined),
            (None, false) => None,
        };

        match cmd {
            Command::Join {
                session_id,
                user_id,
                name,
                role,
            } => self.handle_join(session_id, user_id, name, role).await,

            Command::Ping => Ok(Response::pong()),

            Command::Quit => {
                self.closing = true;
                Ok(Response::ok_with_message("Goodbye"))
            }

            Command::Merge { base, theirs, mine } => {
                Ok(Response::merged(three_way_merge(&base, &theirs, &mine)?))
            }

            cmd => {
                let member = member.ok_or(ProtocolError::NotJoined)?;
                self.handle_session_command(member, cmd)
            }
        }
    }

    async fn handle_join(
        &mut self,
        session_id: SessionId,
        user_id: String,
        name: Option<String>,
        role: cowrite_core::Role,
    ) -> ProtocolResult<Response> {
        if self.joined.is_some() {
            self.cleanup();
        }

        let name = name.unwrap_or_else(|| user_id.clone());
        let participant = Participant::new(user_id.clone(), name, role);
        let outcome = self.registry.join(&session_id, participant).await?;
        self.publish(&session_id, outcome.events);

        info!(client = %self.client_id, session = %session_id, user = %user_id, "Joined session");
        self.joined = Some(Membership { session_id, user_id });

        Ok(Response::State { session: outcome.value })
    }

    fn handle_session_command(
        &mut self,
        member: Membership,
        cmd: Command,
    ) -> ProtocolResult<Response> {
        let Membership { session_id, user_id } = member;
        let registry = self.registry.clone();

        let response = match cmd {
            Command::Leave => {
                let outcome = registry.leave(&session_id, &user_id)?;
                self.publish(&session_id, outcome.events);
                self.joined = None;
                Response::ok()
            }

            Command::Edit {
                file_id,
                base_version,
                mut operations,
            } => {
                let now = now_millis();
                for op in &mut operations {
                    op.author = user_id.clone();
                    op.base_version = base_version;
                    if op.timestamp == 0 {
                        op.timestamp = now;
                    }
                }

                let outcome = registry.edit_batch(
                    &session_id,
                    &file_id,
                    &user_id,
                    operations,
                    base_version,
                )?;
                self.publish(&session_id, outcome.events);

                match outcome.value {
                    BatchOutcome::Applied { version, operations } => Response::Applied {
                        file_id,
                        version,
                        operations,
                    },
                    BatchOutcome::Conflict { markers } => Response::Conflict { file_id, markers },
                }
            }

            Command::Cursor { cursor, selection } => {
                let outcome = registry.cursor_update(&session_id, &user_id, cursor, selection)?;
                self.publish(&session_id, outcome.events);
                Response::ok()
            }

            Command::Lock {
                file_id,
                start_line,
                end_line,
                duration_secs,
            } => match registry.request_lock(
                &session_id,
                &file_id,
                &user_id,
                start_line,
                end_line,
                duration_secs,
            ) {
                Ok(outcome) => {
                    self.publish(&session_id, outcome.events);
                    Response::LockGranted {
                        file_id,
                        lock: outcome.value,
                    }
                }
                Err(CoreError::LockDenied { conflicting }) => {
                    Response::LockDenied { file_id, conflicting }
                }
                Err(e) => return Err(e.into()),
            },

            Command::Unlock {
                file_id,
                start_line,
                end_line,
            } => {
                let outcome =
                    registry.release_lock(&session_id, &file_id, &user_id, start_line, end_line)?;
                let released = outcome.value.is_some();
                self.publish(&session_id, outcome.events);
                if released {
                    Response::ok()
                } else {
                    Response::ok_with_message("No matching lock")
                }
            }

            Command::Resolve {
                file_id,
                conflict_id,
                strategy,
                merged_content,
            } => {
                let outcome = registry.resolve_conflict(
                    &session_id,
                    &file_id,
                    &user_id,
                    &conflict_id,
                    strategy,
                    merged_content,
                )?;
                self.publish(&session_id, outcome.events);
                Response::Resolved {
                    file_id,
                    conflict_id,
                    version: outcome.value,
                }
            }

            Command::Presence { presence } => {
                let outcome = registry.presence(&session_id, &user_id, presence)?;
                self.publish(&session_id, outcome.events);
                Response::ok()
            }

            Command::Events { limit } => Response::Events {
                events: registry.events(&session_id, limit)?,
            },

            other => {
                return Err(ProtocolError::InvalidCommand(format!(
                    "Unexpected command: {}",
                    other.name()
                )))
            }
        };

        Ok(response)
    }

    fn publish(&self, session_id: &SessionId, events: Vec<OutboundEvent>) {
        self.registry.publish(session_id, Some(&self.client_id), events);
    }

    /// Whether the client asked to close the connection
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Session this connection is joined to
    pub fn session_id(&self) -> Option<&SessionId> {
        self.joined.as_ref().map(|m| &m.session_id)
    }

    /// Leave the joined session, if any; called when the connection closes
    ///
    /// The user stays in the session while another of their connections is
    /// still joined.
    pub fn cleanup(&mut self) {
        let Some(Membership { session_id, user_id }) = self.joined.take() else {
            return;
        };

        match self.registry.leave(&session_id, &user_id) {
            Ok(outcome) => self.publish(&session_id, outcome.events),
            // Session may have been expired or removed meanwhile
            Err(e) => warn!(
                client = %self.client_id,
                session = %session_id,
                error = %e,
                "Leave on cleanup failed"
            ),
        }
    }

    /// Get a receiver for session events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.registry.subscribe()
    }

    /// Check if an event belongs to this connection's session and was not
    /// caused by this connection
    pub fn matches_session(&self, event: &SessionEvent) -> bool {
        match &self.joined {
            Some(member) => {
                event.session_id == member.session_id
                    && event.origin.as_deref() != Some(self.client_id.as_str())
            }
            None => false,
        }
    }
}
