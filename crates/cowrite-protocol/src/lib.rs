//! Cowrite wire protocol
//!
//! Newline-delimited JSON. Each inbound frame is one [`Command`] tagged by
//! `"cmd"`; each outbound frame is one [`Response`] tagged by `"type"`.
//!
//! ```text
//! -> {"cmd":"join","sessionId":"s1","userId":"ana"}
//! <- {"type":"state","session":{...}}
//! -> {"cmd":"edit","fileId":"main.rs","baseVersion":1,"operations":[...]}
//! <- {"type":"applied","fileId":"main.rs","version":2,"operations":[...]}
//! <- {"type":"event","sessionId":"s1","payload":{"event":"code-updated",...}}
//! ```

pub mod command;
pub mod error;
pub mod parser;
pub mod response;

pub use command::Command;
pub use error::{ProtocolError, ProtocolResult};
pub use parser::{parse_frame, Parser, MAX_MESSAGE_SIZE};
pub use response::Response;
