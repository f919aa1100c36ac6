//! Framed peer connection.
//!
//! A [`Connection`] wraps one TCP stream in two tasks:
//!
//! - a **reader** that feeds socket bytes through the receive buffer and
//!   framed codec, forwarding each decoded message to the manager loop in
//!   arrival order;
//! - a **writer** that drains a bounded queue of pre-encoded frames into
//!   the socket, preserving the order `send` was called in.
//!
//! The manager loop never touches the socket directly. It owns the
//! `Connection` handle: `send` enqueues a frame, `close` cancels both
//! tasks. Once the reader observes EOF, a read error, or an illegal frame
//! it reports `ConnectionClosed` exactly once and stops.

use crate::manager::{ManagerEvent, ManagerHandle};
use lancoop_core::buffer::RecvBuffer;
use lancoop_core::protocol::{self, Decoded};
use lancoop_core::types::KEEPALIVE_IDLE;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Process-local identifier for one connection. Events from the reader
/// carry it so the manager can route them to the owning machine even
/// before the peer's uuid is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

/// Depth of the write queue. Backpressure beyond this drops frames with a
/// warning rather than blocking the manager loop.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Handle to a live peer connection, owned by the machine.
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer_addr: Option<SocketAddr>,
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Connection {
    /// Wires up a freshly connected TCP stream: applies transport options
    /// (TCP_NODELAY, 20 s keepalive) and spawns the reader/writer tasks.
    pub fn spawn(stream: TcpStream, events: ManagerHandle) -> std::io::Result<Self> {
        stream.set_nodelay(true)?;
        let sock = SockRef::from(&stream);
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE))?;

        let peer_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        Ok(Self::spawn_parts(read_half, write_half, peer_addr, events))
    }

    /// Spawns the reader/writer tasks over arbitrary stream halves.
    ///
    /// Split out of [`Connection::spawn`] so tests can drive a connection
    /// over an in-memory duplex instead of a real socket.
    pub fn spawn_parts<R, W>(
        read_half: R,
        write_half: W,
        peer_addr: Option<SocketAddr>,
        events: ManagerHandle,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = next_conn_id();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE_DEPTH);

        tokio::spawn(read_loop(id, read_half, events, cancel.clone()));
        tokio::spawn(write_loop(id, write_half, rx, cancel.clone()));

        Self {
            id,
            peer_addr,
            tx,
            cancel,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queues one encoded frame for transmission.
    ///
    /// Returns `false` (after logging a warning) when the connection is
    /// already reset or the queue is full — the frame is dropped, matching
    /// the send discipline of the session layer.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if self.cancel.is_cancelled() {
            warn!(conn = %self.id, "send on reset connection dropped");
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "failed to queue frame");
                false
            }
        }
    }

    /// Cancels both tasks. Idempotent; the socket closes when the write
    /// half is dropped by its task.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Reads socket bytes, drains complete frames through the codec, and
/// forwards each message to the manager. Reports the close exactly once.
async fn read_loop<R>(id: ConnId, mut read_half: R, events: ManagerHandle, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = RecvBuffer::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => break, // peer closed
                Ok(n) => n,
                Err(e) => {
                    debug!(conn = %id, error = %e, "read error");
                    break;
                }
            },
        };
        buf.extend(&chunk[..n]);

        // Drain every complete frame out of this read before the next await.
        loop {
            match protocol::decode(&mut buf) {
                Decoded::Message(message) => {
                    if events
                        .send(ManagerEvent::Message { conn_id: id, message })
                        .await
                        .is_err()
                    {
                        // Manager is gone; nothing left to report to.
                        cancel.cancel();
                        return;
                    }
                }
                Decoded::Partial => break,
                Decoded::Illegal => {
                    warn!(conn = %id, "illegal frame, closing connection");
                    cancel.cancel();
                    let _ = events
                        .send(ManagerEvent::ConnectionClosed {
                            conn_id: id,
                            illegal: true,
                        })
                        .await;
                    return;
                }
            }
        }
    }

    cancel.cancel();
    let _ = events
        .send(ManagerEvent::ConnectionClosed {
            conn_id: id,
            illegal: false,
        })
        .await;
}

/// Drains the write queue into the socket in FIFO order.
///
/// Frames already queued when the connection is closed are still
/// flushed — a refusal sent right before `close` must reach the peer.
async fn write_loop<W>(
    id: ConnId,
    mut write_half: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            // Queued frames win over cancellation so the queue drains.
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break, // Connection handle dropped
            },
            _ = cancel.cancelled() => {
                while let Ok(frame) = rx.try_recv() {
                    if write_half.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };
        if let Err(e) = write_half.write_all(&frame).await {
            debug!(conn = %id, error = %e, "write error, closing connection");
            cancel.cancel();
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
