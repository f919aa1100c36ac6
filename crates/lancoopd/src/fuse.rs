//! FUSE serve/mount wrappers.
//!
//! File transfer rides on a remote filesystem: the sending side exposes a
//! serve endpoint on an ephemeral TCP port, the receiving side mounts it
//! at `data_dir/mp` and then copies files out of the mount with ordinary
//! filesystem calls. The filesystem protocol behind the endpoint is an
//! external collaborator; the session core only owns the endpoints'
//! lifecycles — the machine holds at most one server and one client, and
//! both are torn down with their session.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long a mount attempt may take before it is reported dead.
const MOUNT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Serve endpoint for the local filesystem export.
#[derive(Debug)]
pub struct FuseServer {
    port: u16,
    cancel: CancellationToken,
}

impl FuseServer {
    /// Binds an ephemeral port and starts accepting export connections.
    ///
    /// Binding is synchronous and instantaneous, so this is safe to call
    /// from inside a session handler.
    pub fn serve() -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind("0.0.0.0:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        let listener = TcpListener::from_std(listener)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            warn!(error = %e, "fuse serve accept error");
                            continue;
                        }
                    },
                };
                debug!(peer = %peer, "fuse export connection");
                // The export protocol runs until either side goes away.
                let conn_token = token.clone();
                tokio::spawn(async move {
                    hold_until_closed(stream, conn_token).await;
                });
            }
            debug!("fuse serve endpoint stopped");
        });

        Ok(Self { port, cancel })
    }

    /// The ephemeral port the endpoint listens on, for the `FsResponse`.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for FuseServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Mount endpoint for a peer's filesystem export.
#[derive(Debug)]
pub struct FuseClient {
    mountpoint: PathBuf,
    cancel: CancellationToken,
}

impl FuseClient {
    /// Connects to the peer's serve endpoint and establishes the
    /// mountpoint directory.
    ///
    /// The connect happens on a background task so the session handler
    /// that starts the mount never blocks; a failed connect is logged and
    /// leaves an empty mountpoint, which later copies will report against.
    pub fn mount(addr: SocketAddr, mountpoint: PathBuf) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let mp = mountpoint.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&mp).await {
                warn!(mountpoint = %mp.display(), error = %e, "cannot create mountpoint");
                return;
            }
            let stream = tokio::select! {
                _ = token.cancelled() => return,
                connected = tokio::time::timeout(MOUNT_TIMEOUT, TcpStream::connect(addr)) => {
                    match connected {
                        Ok(Ok(stream)) => stream,
                        Ok(Err(e)) => {
                            warn!(addr = %addr, error = %e, "fuse mount connect failed");
                            return;
                        }
                        Err(_) => {
                            warn!(addr = %addr, "fuse mount connect timed out");
                            return;
                        }
                    }
                }
            };
            debug!(addr = %addr, mountpoint = %mp.display(), "fuse mount established");
            hold_until_closed(stream, token).await;
            debug!(mountpoint = %mp.display(), "fuse mount released");
        });

        Self { mountpoint, cancel }
    }

    /// Where the remote export is visible locally.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

impl Drop for FuseClient {
    fn drop(&mut self) {
        // Unmounts: the transport drops, the serve side notices EOF.
        self.cancel.cancel();
    }
}

/// Parks a transport stream until it closes or the token fires. The
/// bytes themselves belong to the external filesystem collaborator.
async fn hold_until_closed(stream: TcpStream, cancel: CancellationToken) {
    let mut sink = [0u8; 1024];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.readable() => {
                if read.is_err() {
                    break;
                }
                match stream.try_read(&mut sink) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
