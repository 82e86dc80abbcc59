//! Cowrite Daemon (cowrited)
//!
//! The server process for Cowrite, a real-time collaborative editing core.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 7420, WebSocket on 7421, in-memory storage)
//! cowrited
//!
//! # Custom ports
//! cowrited --tcp-port 8000 --ws-port 8001
//!
//! # With persistence
//! cowrited --db /var/lib/cowrite/cowrite.db
//!
//! # Register sessions from a JSON file, with maintenance settings from TOML
//! cowrited --seed sessions.json --config /etc/cowrite/cowrite.toml
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cowrite_core::{
    ChangeLog, MaintenanceConfig, MaintenanceScheduler, SessionId, SessionRegistry, SessionSeed,
    SessionSource,
};
use cowrite_storage::{MemoryStorage, SessionCatalog, SqliteStorage};
use cowrite_transport::{TcpServer, WebSocketServer};

/// Cowrite Daemon - real-time collaborative editing server
#[derive(Parser, Debug)]
#[command(name = "cowrited")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(long, env = "COWRITE_TCP_PORT", default_value = "7420")]
    tcp_port: u16,

    /// WebSocket port to listen on
    #[arg(long, env = "COWRITE_WS_PORT", default_value = "7421")]
    ws_port: u16,

    /// Bind address
    #[arg(long, env = "COWRITE_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Configuration file path (TOML)
    #[arg(short, long, env = "COWRITE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "COWRITE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Disable TCP server
    #[arg(long)]
    no_tcp: bool,

    /// Disable WebSocket server
    #[arg(long)]
    no_ws: bool,

    /// SQLite database path for persistence (default: in-memory only)
    #[arg(long, env = "COWRITE_DB")]
    db: Option<PathBuf>,

    /// JSON file mapping session ids to their roster and files
    #[arg(long, env = "COWRITE_SEED")]
    seed: Option<PathBuf>,
}

/// Settings read from the TOML file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    maintenance: MaintenanceConfig,
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn load_seeds(path: &Path) -> Result<BTreeMap<SessionId, SessionSeed>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let file_config = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration file");
            load_file_config(path)?
        }
        None => FileConfig::default(),
    };

    if let Some(db_path) = &args.db {
        info!(path = %db_path.display(), "Initializing SQLite persistence");
        match SqliteStorage::new(db_path) {
            Ok(storage) => {
                info!("SQLite persistence enabled");
                return serve(args, file_config, Arc::new(storage)).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to initialize SQLite, running in-memory only");
            }
        }
    } else {
        info!("Running in-memory only (no --db specified)");
    }

    serve(args, file_config, Arc::new(MemoryStorage::new())).await
}

async fn serve<S>(args: Args, file_config: FileConfig, storage: Arc<S>) -> Result<()>
where
    S: SessionSource + ChangeLog + SessionCatalog + 'static,
{
    if let Some(path) = &args.seed {
        let seeds = load_seeds(path)?;
        for (id, seed) in &seeds {
            storage.save_session(id, seed).await?;
        }
        info!(sessions = seeds.len(), path = %path.display(), "Registered seed sessions");
    }

    let stats = storage.stats().await?;
    info!(
        sessions = stats.session_count,
        records = stats.record_count,
        "Storage ready"
    );

    let registry = Arc::new(SessionRegistry::new(storage.clone()));

    info!(
        tcp_port = args.tcp_port,
        ws_port = args.ws_port,
        bind = %args.bind,
        "Starting Cowrite daemon"
    );

    // Start servers
    let mut handles = Vec::new();

    if !args.no_tcp {
        let tcp_addr: SocketAddr = format!("{}:{}", args.bind, args.tcp_port).parse()?;
        let tcp_server = TcpServer::new(registry.clone(), tcp_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = tcp_server.run().await {
                tracing::error!(error = %e, "TCP server error");
            }
        }));
    }

    if !args.no_ws {
        let ws_addr: SocketAddr = format!("{}:{}", args.bind, args.ws_port).parse()?;
        let ws_server = WebSocketServer::new(registry.clone(), ws_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = ws_server.run().await {
                tracing::error!(error = %e, "WebSocket server error");
            }
        }));
    }

    if handles.is_empty() {
        anyhow::bail!("At least one transport must be enabled");
    }

    let scheduler = Arc::new(MaintenanceScheduler::new(
        registry.clone(),
        storage,
        file_config.maintenance,
    ));
    let maintenance = scheduler.spawn();

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for handle in &handles {
        handle.abort();
    }
    let flushed = maintenance.shutdown().await;
    info!(written = flushed.written, failed = flushed.failed, "Final flush complete");

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔═╗╔═╗╦ ╦╦═╗╦╔╦╗╔═╗
  ║  ║ ║║║║╠╦╝║ ║ ║╣
  ╚═╝╚═╝╚╩╝╩╚═╩ ╩ ╚═╝
  Real-time collaborative editing
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
