//! Cowrite Transport Layer
//!
//! Dispatches wire commands to the session registry and fans session events
//! out to connected clients:
//! - TCP: newline-delimited JSON
//! - WebSocket: one JSON object per text message

pub mod handler;
pub mod tcp;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use handler::ConnectionHandler;
pub use tcp::TcpServer;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketServer;
