//! Incremental JSON-lines frame parser

use crate::command::Command;
use crate::error::{ProtocolError, ProtocolResult};
use bytes::BytesMut;

/// Maximum frame size (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Splits a byte stream into newline-terminated JSON commands
pub struct Parser {
    buffer: BytesMut,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) -> ProtocolResult<()> {
        if self.buffer.len() + data.len() > MAX_MESSAGE_SIZE {
            let size = self.buffer.len() + data.len();
            self.buffer.clear();
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Try to parse a complete command from the buffer
    ///
    /// Blank lines are skipped. A malformed line is consumed and reported,
    /// so the next call continues with the following line.
    pub fn parse(&mut self) -> ProtocolResult<Option<Command>> {
        loop {
            let line_end = match self.buffer.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None => return Ok(None),
            };

            let line = self.buffer.split_to(line_end + 1);
            let text = String::from_utf8_lossy(&line[..line_end]);
            let text = text.trim();

            if text.is_empty() {
                continue;
            }

            return parse_frame(text).map(Some);
        }
    }

    /// Bytes waiting for a newline
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one complete frame, e.g. a WebSocket text message
pub fn parse_frame(text: &str) -> ProtocolResult<Command> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: text.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(serde_json::from_str(text)?)
}
