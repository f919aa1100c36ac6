//! lancoop daemon — pairs LAN peers and multiplexes cooperation services.
//!
//! # Usage
//!
//! ```bash
//! lancoopd                      # Start with defaults from config.toml
//! lancoopd --name "Workroom"    # Override the display name for this run
//! lancoopd --port 4050          # Use a specific TCP session port
//! lancoopd --storage ~/inbox    # Where received files land
//! lancoopd --no-beacon          # Listen for peers but never announce
//! ```
//!
//! On first run, the daemon generates a stable device uuid and derives a
//! display name from the hostname (or prompts when run interactively).
//! The config is saved to `~/.config/lancoop/config.toml`.
//!
//! # Architecture
//!
//! The daemon spawns a handful of concurrent tasks:
//! 1. TCP session listener (accepts peer connections)
//! 2. UDP discovery listener + optional beacon broadcaster
//! 3. Clipboard bridge (collaborator seam to the desktop selection store)
//! 4. Per-connection reader/writer tasks
//! 5. The manager event loop, which owns all peer state

mod clipboard;
mod confirm;
mod conn;
mod copyfile;
mod discovery;
mod fuse;
mod input;
mod machine;
mod manager;
mod notifications;
mod server;

use anyhow::{Context, Result};
use clap::Parser;
use clipboard::ClipboardHandle;
use discovery::Discovery;
use lancoop_core::config::AppConfig;
use manager::{Manager, ManagerEvent};
use server::SessionServer;
use std::io::{self, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// lancoop daemon — LAN cooperation background service.
#[derive(Parser, Debug)]
#[command(name = "lancoopd", about = "lancoop LAN cooperation daemon")]
struct Cli {
    /// Display name for this device on the network.
    /// Overrides the name in config.toml for this run.
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port for peer sessions (0 = auto-assign).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// UDP port for discovery beacons (0 = config default).
    #[arg(long, default_value = "0")]
    discovery_port: u16,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where received files are written.
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Listen for peers but never broadcast our own beacon.
    #[arg(long)]
    no_beacon: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging. The LANCOOP_LOG env var controls the level
    // (default: info). Logs go to stderr and a file in the data dir.
    init_logging();

    // -----------------------------------------------------------------------
    // Load or create configuration
    // -----------------------------------------------------------------------
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match AppConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("first run detected, creating new config");
            let device_name = get_device_name()?;
            let config = AppConfig::new_first_run(&device_name);
            config.save_to(&config_path)?;
            info!(
                path = %config_path.display(),
                device_uuid = %config.device_uuid,
                device_name = %config.device_name,
                "saved new config"
            );
            config
        }
    };

    // CLI overrides
    if let Some(name) = &cli.name {
        config.device_name = name.clone();
    }
    if cli.port != 0 {
        config.tcp_port = cli.port;
    }
    if cli.discovery_port != 0 {
        config.discovery_port = cli.discovery_port;
    }
    if let Some(storage) = &cli.storage {
        config.storage_dir = Some(storage.clone());
    }

    // -----------------------------------------------------------------------
    // Start the TCP session listener
    // -----------------------------------------------------------------------
    let bind_addr = format!("0.0.0.0:{}", config.tcp_port);
    let session_server = SessionServer::bind(&bind_addr)
        .await
        .context("failed to start session listener")?;
    let tcp_port = session_server.port();

    // -----------------------------------------------------------------------
    // Manager channel — the single wake point for every subsystem
    // -----------------------------------------------------------------------
    let (handle, events_rx) = manager::channel();

    // -----------------------------------------------------------------------
    // Start UDP discovery
    // -----------------------------------------------------------------------
    let local_device = config.device_info();
    let discovery = Discovery::bind(config.discovery_port, local_device, tcp_port)
        .context("failed to start discovery")?;

    let discovery_cancel = CancellationToken::new();
    discovery.spawn_listener(handle.clone(), discovery_cancel.clone());
    if cli.no_beacon {
        info!("beacon broadcaster disabled (--no-beacon)");
    } else {
        discovery.spawn_broadcaster(discovery_cancel.clone());
    }

    // -----------------------------------------------------------------------
    // Clipboard bridge
    // -----------------------------------------------------------------------
    let clipboard = ClipboardHandle::start(handle.clone());

    // -----------------------------------------------------------------------
    // Mountpoint for remote filesystem exports
    // -----------------------------------------------------------------------
    let mountpoint = AppConfig::mountpoint().context("could not determine data directory")?;
    std::fs::create_dir_all(&mountpoint)
        .with_context(|| format!("failed to create mountpoint at {}", mountpoint.display()))?;

    // -----------------------------------------------------------------------
    // Wire everything together
    // -----------------------------------------------------------------------
    let daemon = Manager::new(
        config,
        mountpoint,
        discovery.handle(),
        clipboard,
        handle.clone(),
        events_rx,
    );

    tokio::spawn(session_server.accept_loop(handle.clone()));

    // Ctrl+C drains every session before the process exits.
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating shutdown");
                let _ = shutdown_handle.send(ManagerEvent::Shutdown).await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
        }
    });

    // Run the manager loop (blocks until shutdown).
    info!(tcp_port, "daemon is running. Press Ctrl+C to stop.");
    daemon.run().await;

    discovery_cancel.cancel();
    info!("daemon stopped");
    Ok(())
}

/// Picks a display name on first run.
///
/// If stdin is a terminal, asks the user; otherwise (autostart, service
/// manager) falls back to the system hostname.
fn get_device_name() -> Result<String> {
    if std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        print!("Enter a display name for this device: ");
        io::stdout().flush()?;
        let mut name = String::new();
        io::stdin().read_line(&mut name)?;
        let name = name.trim().to_string();
        if name.is_empty() {
            return Ok(get_hostname());
        }
        Ok(name)
    } else {
        Ok(get_hostname())
    }
}

/// System hostname as the fallback display name.
fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "lancoop-device".to_string())
}

/// Initializes the tracing logging infrastructure.
///
/// Sets up a layered subscriber that writes to:
/// 1. stderr — so logs appear in the terminal when running interactively
/// 2. A log file at `~/.local/share/lancoop/daemon.log` — persists across runs
///
/// The log level is controlled by the `LANCOOP_LOG` environment variable.
/// Defaults to `info` if not set.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_env("LANCOOP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    // File logging is best-effort; the daemon still works with stderr only.
    let file_layer = AppConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("daemon.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| {
            fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false) // No ANSI color codes in the log file
        });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
