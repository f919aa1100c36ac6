//! TCP session listener.
//!
//! Accepts incoming connections from other lancoop daemons. An inbound
//! connection is anonymous until its first frame — pairing starts with a
//! `PairRequest` carrying the peer's identity — so the accept loop only
//! wires the stream into a [`Connection`] and hands it to the manager,
//! which parks it until that frame arrives.

use crate::conn::Connection;
use crate::manager::{ManagerEvent, ManagerHandle};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Errors that can occur in the session server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind TCP listener: {0}")]
    Bind(std::io::Error),
}

/// TCP server that accepts connections from other lancoop peers.
pub struct SessionServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl SessionServer {
    /// Binds a new TCP server to the given address.
    ///
    /// Use port `0` to let the OS assign an ephemeral port, then read it
    /// back with [`SessionServer::port`] for the discovery beacon.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;
        info!(addr = %local_addr, "session listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns just the port number.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Runs the accept loop until the manager goes away.
    pub async fn accept_loop(self, events: ManagerHandle) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "accepted session connection");
                    let conn = match Connection::spawn(stream, events.clone()) {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(peer = %peer_addr, error = %e, "failed to set up connection");
                            continue;
                        }
                    };
                    if events
                        .send(ManagerEvent::InboundConnected { conn })
                        .await
                        .is_err()
                    {
                        debug!("manager channel closed, stopping accept loop");
                        break;
                    }
                }
                Err(e) => {
                    // Accept errors are usually transient (too many open
                    // files, etc.). Log and continue rather than crashing.
                    error!(error = %e, "failed to accept session connection");
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}
