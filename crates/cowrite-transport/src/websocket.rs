//! WebSocket transport for Cowrite
//!
//! Each text message carries exactly one JSON command; each response and
//! pushed event goes out as one text message.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use cowrite_core::SessionRegistry;
use cowrite_protocol::Response;

use crate::handler::ConnectionHandler;

/// WebSocket Server for browser clients
pub struct WebSocketServer {
    registry: Arc<SessionRegistry>,
    addr: SocketAddr,
    client_counter: AtomicU64,
}

impl WebSocketServer {
    pub fn new(registry: Arc<SessionRegistry>, addr: SocketAddr) -> Self {
        Self {
            registry,
            addr,
            client_counter: AtomicU64::new(0),
        }
    }

    /// Start the WebSocket server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Cowrite WebSocket server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "ws:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let registry = self.registry.clone();

                    tokio::spawn(async move {
                        let result =
                            Self::handle_connection(stream, client_id.clone(), registry).await;
                        if let Err(e) = result {
                            error!(client = %client_id, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        client_id: String,
        registry: Arc<SessionRegistry>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        info!(client = %client_id, "WebSocket client connected");

        let mut handler = ConnectionHandler::new(client_id.clone(), registry);
        let mut event_rx = handler.subscribe_events();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let response = handler.process_frame(&text).await;
                            if let Err(e) = write.send(Message::Text(response.to_json())).await {
                                break Err(e.into());
                            }
                            if handler.is_closing() {
                                break Ok(());
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            let text = String::from_utf8_lossy(&data);
                            let response = handler.process_frame(&text).await;
                            if let Err(e) = write.send(Message::Text(response.to_json())).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(client = %client_id, "WebSocket client disconnected");
                            break Ok(());
                        }
                        Some(Ok(_)) => {
                            debug!(client = %client_id, "Ignoring WebSocket control frame");
                        }
                        Some(Err(e)) => {
                            error!(client = %client_id, error = %e, "WebSocket read error");
                            break Ok(());
                        }
                    }
                }

                result = event_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if handler.matches_session(&event) {
                                let text = Response::event(event).to_json();
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    error!(
                                        client = %client_id,
                                        error = %e,
                                        "WebSocket write error"
                                    );
                                    break Ok(());
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(
                                client = %client_id,
                                missed = n,
                                "WebSocket client lagged behind session events"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            break Ok(());
                        }
                    }
                }
            }
        };

        handler.cleanup();
        result
    }
}
