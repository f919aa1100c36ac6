//! UDP beacon discovery hook.
//!
//! Peers announce themselves with small UDP datagrams on a well-known
//! port. A beacon carries the scan key, the sender's [`DeviceInfo`], and
//! its TCP listen port. The daemon:
//!
//! 1. **listens** for beacons and forwards them into the manager loop,
//!    which creates or refreshes the corresponding machine;
//! 2. exposes [`DiscoveryHandle::ping`] so a machine can probe one
//!    address directly (re-discovery after a failed connect, and the
//!    periodic ping of a known-but-unconnected peer);
//! 3. optionally **broadcasts** its own beacon every ping interval so
//!    that a LAN full of daemons converges without manual addressing.
//!
//! Datagrams are a fixed 8-byte magic followed by a MessagePack body.
//! Anything without the magic, with an undecodable body, or with the
//! wrong scan key is silently ignored — broadcast ports see a lot of
//! unrelated traffic.

use crate::manager::{ManagerEvent, ManagerHandle};
use lancoop_core::types::{DeviceInfo, PeerUuid, PING_INTERVAL, SCAN_KEY};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Magic bytes prepended to every discovery datagram so that unrelated
/// broadcast traffic on the same port is rejected before deserialization.
const BEACON_MAGIC: &[u8; 8] = b"DDECSCAN";

/// Errors that can occur while setting up discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to create discovery socket: {0}")]
    Create(std::io::Error),
    #[error("failed to bind discovery socket on port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
}

/// On-wire discovery record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Beacon {
    /// Scan key; receivers drop beacons from other product families.
    key: String,
    /// Identity of the announcing device.
    device: DeviceInfo,
    /// TCP port its session listener is bound to.
    tcp_port: u16,
}

fn encode_beacon(beacon: &Beacon) -> Vec<u8> {
    // Beacon serialization cannot fail: the record is a fixed struct of
    // strings and integers.
    let body = rmp_serde::to_vec_named(beacon).unwrap_or_default();
    let mut buf = Vec::with_capacity(BEACON_MAGIC.len() + body.len());
    buf.extend_from_slice(BEACON_MAGIC);
    buf.extend_from_slice(&body);
    buf
}

fn decode_beacon(data: &[u8]) -> Option<Beacon> {
    if data.len() <= BEACON_MAGIC.len() || &data[..BEACON_MAGIC.len()] != BEACON_MAGIC {
        return None;
    }
    rmp_serde::from_slice(&data[BEACON_MAGIC.len()..]).ok()
}

/// Discovery subsystem: one UDP socket shared by the listener, the
/// broadcaster, and every `ping` caller.
pub struct Discovery {
    socket: Arc<UdpSocket>,
    port: u16,
    beacon: Arc<Vec<u8>>,
    own_uuid: PeerUuid,
}

impl Discovery {
    /// Binds the discovery socket with SO_REUSEADDR/SO_REUSEPORT so that
    /// several daemons on one host (development, tests) can share the
    /// port, and with SO_BROADCAST so the same socket can announce.
    pub fn bind(port: u16, device: DeviceInfo, tcp_port: u16) -> Result<Self, DiscoveryError> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

        // socket2 lets us set options *before* binding.
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(DiscoveryError::Create)?;
        socket
            .set_reuse_address(true)
            .map_err(DiscoveryError::Create)?;
        #[cfg(not(target_os = "windows"))]
        socket.set_reuse_port(true).map_err(DiscoveryError::Create)?;
        socket.set_broadcast(true).map_err(DiscoveryError::Create)?;
        socket
            .set_nonblocking(true)
            .map_err(DiscoveryError::Create)?;
        socket
            .bind(&socket2::SockAddr::from(addr))
            .map_err(|e| DiscoveryError::Bind { port, source: e })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(DiscoveryError::Create)?;

        info!(port, "discovery socket bound");

        let own_uuid = device.uuid.clone();
        let beacon = encode_beacon(&Beacon {
            key: SCAN_KEY.to_string(),
            device,
            tcp_port,
        });

        Ok(Self {
            socket: Arc::new(socket),
            port,
            beacon: Arc::new(beacon),
            own_uuid,
        })
    }

    /// A cheap handle for the manager and machines to emit pings through.
    pub fn handle(&self) -> DiscoveryHandle {
        DiscoveryHandle {
            socket: self.socket.clone(),
            port: self.port,
            beacon: self.beacon.clone(),
        }
    }

    /// Spawns the listener task: decodes incoming beacons and forwards
    /// them to the manager. Our own beacons (same uuid) are dropped.
    pub fn spawn_listener(&self, events: ManagerHandle, cancel: CancellationToken) {
        let socket = self.socket.clone();
        let own_uuid = self.own_uuid.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, src) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = socket.recv_from(&mut buf) => match recv {
                        Ok(r) => r,
                        Err(e) => {
                            warn!(error = %e, "discovery recv error");
                            continue;
                        }
                    },
                };

                let Some(beacon) = decode_beacon(&buf[..len]) else {
                    continue;
                };
                if beacon.key != SCAN_KEY {
                    debug!(src = %src, "beacon with foreign scan key ignored");
                    continue;
                }
                if beacon.device.uuid == own_uuid {
                    continue;
                }

                let event = ManagerEvent::Beacon {
                    addr: src.ip(),
                    tcp_port: beacon.tcp_port,
                    device: beacon.device,
                };
                if events.send(event).await.is_err() {
                    break; // manager gone
                }
            }
            debug!("discovery listener stopped");
        });
    }

    /// Spawns the periodic self-announcement task.
    pub fn spawn_broadcaster(&self, cancel: CancellationToken) {
        let socket = self.socket.clone();
        let beacon = self.beacon.clone();
        let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, self.port));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = socket.send_to(&beacon, target).await {
                            warn!(error = %e, "beacon broadcast failed");
                        }
                    }
                }
            }
            debug!("beacon broadcaster stopped");
        });
    }
}

/// Clonable ping emitter, handed to the manager loop.
#[derive(Clone)]
pub struct DiscoveryHandle {
    socket: Arc<UdpSocket>,
    port: u16,
    beacon: Arc<Vec<u8>>,
}

impl DiscoveryHandle {
    /// Sends one unicast beacon to `ip` on the discovery port.
    ///
    /// Non-blocking by design — the manager loop calls this from inside a
    /// handler. A full socket buffer just drops the ping; the next timer
    /// tick retries.
    pub fn ping(&self, ip: IpAddr) {
        let target = SocketAddr::new(ip, self.port);
        if let Err(e) = self.socket.try_send_to(&self.beacon, target) {
            debug!(target = %target, error = %e, "ping not sent");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
