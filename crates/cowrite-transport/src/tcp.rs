//! TCP transport for Cowrite

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use cowrite_core::SessionRegistry;
use cowrite_protocol::Response;

use crate::handler::ConnectionHandler;

/// TCP Server speaking newline-delimited JSON
pub struct TcpServer {
    registry: Arc<SessionRegistry>,
    addr: SocketAddr,
    client_counter: AtomicU64,
}

impl TcpServer {
    pub fn new(registry: Arc<SessionRegistry>, addr: SocketAddr) -> Self {
        Self {
            registry,
            addr,
            client_counter: AtomicU64::new(0),
        }
    }

    /// Start the TCP server
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Cowrite TCP server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "tcp:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let registry = self.registry.clone();

                    tokio::spawn(async move {
                        let result =
                            Self::handle_connection(stream, client_id.clone(), registry).await;
                        if let Err(e) = result {
                            error!(client = %client_id, error = %e, "Connection error");
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
        mut stream: TcpStream,
        client_id: String,
        registry: Arc<SessionRegistry>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(client = %client_id, "Client connected");

        let mut handler = ConnectionHandler::new(client_id.clone(), registry);
        let mut buf = vec![0u8; 4096];
        let mut event_rx = handler.subscribe_events();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
            tokio::select! {
                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            info!(client = %client_id, "Client disconnected");
                            break Ok(());
                        }
                        Ok(n) => {
                            let responses = handler.process(&buf[..n]).await;
                            if let Err(e) = write_responses(&mut stream, &responses).await {
                                break Err(e.into());
                            }
                            if handler.is_closing() {
                                break Ok(());
                            }
                        }
                        Err(e) => {
                            error!(client = %client_id, error = %e, "Read error");
                            break Ok(());
                        }
                    }
                }

                result = event_rx.recv() => {
                    match result {
                        Ok(event) => {
                            if handler.matches_session(&event) {
                                let data = Response::event(event).encode();
                                if let Err(e) = stream.write_all(&data).await {
                                    error!(client = %client_id, error = %e, "Write error");
                                    break Ok(());
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(
                                client = %client_id,
                                missed = n,
                                "Client lagged behind session events"
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

async fn write_responses(stream: &mut TcpStream, responses: &[Response]) -> std::io::Result<()> {
    for response in responses {
        stream.write_all(&response.encode()).await?;
    }
    Ok(())
}
