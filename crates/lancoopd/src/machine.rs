//! Per-peer session state machine.
//!
//! A [`Machine`] is the daemon's record of one remote peer: its identity,
//! its last-known address, the owned connection once one exists, the
//! wrappers serving the active sub-protocols, and the two liveness
//! timers. The manager owns all machines and feeds them events; a
//! machine never runs concurrently with itself.
//!
//! # Session states
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──connected──▶ AwaitingPair ──agree──▶ Paired
//!   │                     │                           │                    │
//!   │                 dial failed                  rejected            stream closed
//!   ◀─────────────────────┴───────────────────────────┴────────────────────┘
//!
//! Idle ──inbound PairRequest──▶ AwaitingUserConfirm ──ACCEPT──▶ Paired
//!                                        └──────────REJECT─────▶ Idle
//! ```
//!
//! Device sharing, the clipboard mirror, and the filesystem mount are
//! flags and wrappers on top of `Paired`, not separate states — they all
//! collapse back to nothing when the stream closes.
//!
//! While unconnected, two timers keep the record honest: every ping
//! interval the machine probes the peer's address through the discovery
//! hook, and a peer silent for the whole offline window is removed by
//! the manager. Both timers stop once a connection is up — from then on
//! TCP keepalive owns liveness.

use crate::confirm::ConfirmDialog;
use crate::conn::{ConnId, Connection};
use crate::copyfile;
use crate::fuse::{FuseClient, FuseServer};
use crate::input::InputEmittor;
use crate::manager::{Effect, Shared, SharingRole};
use lancoop_core::protocol::{self, PeerMessage};
use lancoop_core::types::{
    Compositor, DeviceInfo, DeviceOs, FlowDirection, InputDeviceType, PeerUuid, OFFLINE_WINDOW,
    PING_INTERVAL, SCAN_KEY,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long an outbound dial may take before it counts as failed.
const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Clipboard target carrying the GNOME file-manager copy list.
pub const TARGET_GNOME_COPIED_FILES: &str = "x-special/gnome-copied-files";

/// Clipboard target carrying plain file URIs.
pub const TARGET_URI_LIST: &str = "text/uri-list";

/// Connection-level session state. Service activity (sharing, mount,
/// clipboard) lives in flags on the machine, valid only while `Paired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Known from discovery, no connection.
    Idle,
    /// Outbound dial in flight.
    Connecting,
    /// Outbound connection up, `PairRequest` sent, waiting for the answer.
    AwaitingPair,
    /// Inbound `PairRequest` received, waiting for the local user.
    AwaitingUserConfirm,
    /// Mutual consent reached; the dispatcher is live.
    Paired,
}

/// Per-peer session record. Owned by the manager, keyed by peer uuid.
pub struct Machine {
    uuid: PeerUuid,
    name: String,
    os: DeviceOs,
    compositor: Compositor,
    ip: IpAddr,
    port: u16,

    state: SessionState,
    connection: Option<Connection>,
    confirm: Option<ConfirmDialog>,
    input_emittors: HashMap<InputDeviceType, InputEmittor>,
    fuse_server: Option<FuseServer>,
    fuse_client: Option<FuseClient>,

    ping_deadline: Option<Instant>,
    offline_deadline: Option<Instant>,

    connected: bool,
    device_sharing: bool,
    shared_clipboard: bool,
    mounted: bool,
    direction: FlowDirection,

    /// What the peer last told us about its service toggles. Recorded
    /// for the device-list surface; the session core itself does not
    /// gate on them.
    #[allow(dead_code)]
    remote_clipboard_on: bool,
    #[allow(dead_code)]
    remote_devices_on: bool,

    /// Serial counter for requests this machine originates.
    serial: u32,
}

impl Machine {
    /// Creates a machine for a peer first observed at `ip`, with both
    /// liveness timers armed.
    pub fn new(device: DeviceInfo, ip: IpAddr, port: u16) -> Self {
        let now = Instant::now();
        Self {
            uuid: device.uuid,
            name: device.name,
            os: device.os,
            compositor: device.compositor,
            ip,
            port,
            state: SessionState::Idle,
            connection: None,
            confirm: None,
            input_emittors: HashMap::new(),
            fuse_server: None,
            fuse_client: None,
            ping_deadline: Some(now + PING_INTERVAL),
            offline_deadline: Some(now + OFFLINE_WINDOW),
            connected: false,
            device_sharing: false,
            shared_clipboard: false,
            mounted: false,
            direction: FlowDirection::Right,
            remote_clipboard_on: false,
            remote_devices_on: false,
            serial: 0,
        }
    }

    #[allow(dead_code)]
    pub fn uuid(&self) -> &PeerUuid {
        &self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(dead_code)]
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    #[allow(dead_code)]
    pub fn device_sharing(&self) -> bool {
        self.device_sharing
    }

    #[allow(dead_code)]
    pub fn shared_clipboard(&self) -> bool {
        self.shared_clipboard
    }

    #[allow(dead_code)]
    pub fn mounted(&self) -> bool {
        self.mounted
    }

    #[allow(dead_code)]
    pub fn direction(&self) -> FlowDirection {
        self.direction
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.connection.as_ref().map(|c| c.id())
    }

    fn next_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }

    // -----------------------------------------------------------------
    // Discovery bookkeeping
    // -----------------------------------------------------------------

    /// Refreshes address and identity from a received beacon.
    pub fn update_info(&mut self, ip: IpAddr, port: u16, device: &DeviceInfo) {
        self.ip = ip;
        self.port = port;
        self.name = device.name.clone();
        self.os = device.os;
        self.compositor = device.compositor;
    }

    /// Any sign of life from the peer re-arms both timers. Once
    /// connected the timers stay stopped; the transport owns liveness.
    pub fn received_ping(&mut self) {
        if !self.connected {
            self.arm_timers();
        }
    }

    fn arm_timers(&mut self) {
        let now = Instant::now();
        self.ping_deadline = Some(now + PING_INTERVAL);
        self.offline_deadline = Some(now + OFFLINE_WINDOW);
    }

    fn stop_timers(&mut self) {
        self.ping_deadline = None;
        self.offline_deadline = None;
    }

    /// Timer sweep: emits a discovery ping when due and reports whether
    /// the offline window has fully elapsed (the manager then removes
    /// this machine).
    pub fn sweep(&mut self, now: Instant, shared: &Shared) -> bool {
        if let Some(deadline) = self.ping_deadline {
            if now >= deadline {
                shared.discovery.ping(self.ip);
                self.ping_deadline = Some(now + PING_INTERVAL);
            }
        }
        matches!(self.offline_deadline, Some(deadline) if now >= deadline)
    }

    // -----------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------

    /// Starts an outbound dial to the peer's last-known address.
    pub fn connect(&mut self, shared: &Shared) {
        if self.state != SessionState::Idle || self.connection.is_some() {
            warn!(peer = %self.uuid, state = ?self.state, "connect ignored in this state");
            return;
        }
        self.state = SessionState::Connecting;

        let addr = SocketAddr::new(self.ip, self.port);
        let uuid = self.uuid.clone();
        let handle = shared.handle.clone();
        info!(peer = %uuid, addr = %addr, "dialing peer");

        tokio::spawn(async move {
            use crate::manager::ManagerEvent;
            let event = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => match Connection::spawn(stream, handle.clone()) {
                    Ok(conn) => ManagerEvent::OutboundConnected { uuid, conn },
                    Err(e) => ManagerEvent::OutboundFailed {
                        uuid,
                        error: e.to_string(),
                    },
                },
                Ok(Err(e)) => ManagerEvent::OutboundFailed {
                    uuid,
                    error: e.to_string(),
                },
                Err(_) => ManagerEvent::OutboundFailed {
                    uuid,
                    error: format!("connect timed out after {CONNECT_TIMEOUT:?}"),
                },
            };
            let _ = handle.send(event).await;
        });
    }

    /// The outbound dial completed: adopt the connection, stop the
    /// discovery timers, and open the pair handshake.
    pub fn on_connected(&mut self, shared: &Shared, conn: Connection) {
        if self.state != SessionState::Connecting {
            debug!(peer = %self.uuid, state = ?self.state, "late dial result dropped");
            conn.close();
            return;
        }
        self.connection = Some(conn);
        self.state = SessionState::AwaitingPair;
        self.stop_timers();
        self.send_message(PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: shared.local.clone(),
        });
    }

    /// The outbound dial failed: fall back to discovery.
    pub fn on_connect_failed(&mut self, shared: &Shared, error: &str) {
        if self.state != SessionState::Connecting {
            return;
        }
        warn!(peer = %self.uuid, error, "connect failed, re-probing via beacon");
        self.state = SessionState::Idle;
        shared.discovery.ping(self.ip);
    }

    /// An inbound connection delivered a `PairRequest` for this machine.
    /// Validates the scan key, then puts the decision to the local user.
    pub fn on_inbound_pair_request(
        &mut self,
        shared: &Shared,
        conn: Connection,
        key: &str,
        device: &DeviceInfo,
    ) {
        self.update_info(
            conn.peer_addr().map(|a| a.ip()).unwrap_or(self.ip),
            self.port,
            device,
        );

        if key != SCAN_KEY {
            warn!(peer = %self.uuid, "pair request with wrong scan key rejected");
            Self::refuse_pair(&conn, shared);
            return;
        }

        let dialog = ConfirmDialog::spawn(
            shared.config.confirm_command(),
            &self.name,
            self.uuid.clone(),
            shared.handle.clone(),
        );
        match dialog {
            Ok(dialog) => {
                info!(
                    peer = %self.uuid,
                    name = %self.name,
                    os = ?self.os,
                    compositor = ?self.compositor,
                    "pair request, asking user"
                );
                self.connection = Some(conn);
                self.confirm = Some(dialog);
                self.state = SessionState::AwaitingUserConfirm;
            }
            Err(e) => {
                // No way to ask the user means no consent; refuse.
                warn!(peer = %self.uuid, error = %e, "cannot spawn confirm dialog, rejecting pair");
                Self::refuse_pair(&conn, shared);
                self.state = SessionState::Idle;
            }
        }
    }

    /// Sends a negative `PairResponse` on a connection we are not keeping.
    pub(crate) fn refuse_pair(conn: &Connection, shared: &Shared) {
        if let Ok(frame) = protocol::encode(&PeerMessage::PairResponse {
            key: SCAN_KEY.to_string(),
            device: shared.local.clone(),
            agree: false,
        }) {
            conn.send(frame);
        }
        conn.close();
    }

    /// The local user decided on an inbound pair request.
    pub fn on_confirm(&mut self, shared: &mut Shared, accepted: bool) {
        if self.state != SessionState::AwaitingUserConfirm {
            debug!(peer = %self.uuid, state = ?self.state, "stray confirm decision dropped");
            return;
        }
        self.confirm = None;

        self.send_message(PeerMessage::PairResponse {
            key: SCAN_KEY.to_string(),
            device: shared.local.clone(),
            agree: accepted,
        });

        if accepted {
            info!(peer = %self.uuid, "pair accepted by user");
            self.enter_paired(shared);
        } else {
            info!(peer = %self.uuid, "pair rejected by user");
            self.close_connection();
            self.state = SessionState::Idle;
            self.arm_timers();
        }
    }

    /// Both consent paths end here; outbound-then-agreed and
    /// inbound-then-accepted produce the same paired state and the same
    /// `ServiceOnOff` notification.
    fn enter_paired(&mut self, shared: &Shared) {
        self.state = SessionState::Paired;
        self.connected = true;
        self.stop_timers();
        self.send_message(PeerMessage::ServiceOnOff {
            shared_clipboard_on: shared.config.shared_clipboard_on,
            shared_devices_on: shared.config.shared_devices_on,
        });
    }

    /// The stream closed (peer side, transport error, or illegal frame).
    /// Collapses every service back to nothing and returns to `Idle`.
    pub fn on_closed(&mut self, shared: &mut Shared) {
        info!(peer = %self.uuid, "session closed");
        self.teardown_session(shared);
        self.state = SessionState::Idle;
        self.arm_timers();
    }

    /// Drops the connection and every service wrapper. Used by both the
    /// closed path and full machine removal.
    pub fn teardown_session(&mut self, shared: &mut Shared) {
        if self.device_sharing {
            self.device_sharing = false;
            shared.release_sharing(&self.uuid);
        }
        self.input_emittors.clear();
        self.fuse_server = None;
        if self.fuse_client.take().is_some() {
            self.mounted = false;
        }
        if let Some(dialog) = self.confirm.take() {
            dialog.dismiss();
        }
        self.shared_clipboard = false;
        self.close_connection();
        self.connected = false;
    }

    /// Abandons an in-flight outbound attempt (pair tie-break).
    pub fn abandon_dial(&mut self) {
        debug!(peer = %self.uuid, "abandoning outbound attempt");
        self.close_connection();
        self.state = SessionState::Idle;
    }

    fn close_connection(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close();
        }
    }

    /// Encodes and queues one message on the owned connection. A reset
    /// connection turns this into a warn-and-drop no-op.
    pub fn send_message(&mut self, msg: PeerMessage) {
        let Some(conn) = &self.connection else {
            warn!(peer = %self.uuid, "connection reset, message dropped");
            return;
        };
        match protocol::encode(&msg) {
            Ok(frame) => {
                conn.send(frame);
            }
            Err(e) => warn!(peer = %self.uuid, error = %e, "failed to encode message"),
        }
    }

    // -----------------------------------------------------------------
    // Dispatcher
    // -----------------------------------------------------------------

    /// Routes one decoded message to its handler. Total over the message
    /// union: anything that does not belong to the current state closes
    /// the connection.
    pub fn handle_message(&mut self, shared: &mut Shared, msg: PeerMessage) {
        // Any frame is a sign of life for the discovery timers.
        self.received_ping();

        match (self.state, msg) {
            (SessionState::AwaitingPair, PeerMessage::PairResponse { key, device, agree }) => {
                self.on_pair_response(shared, &key, &device, agree)
            }

            (SessionState::Paired, msg) => self.dispatch_paired(shared, msg),

            (state, msg) => {
                warn!(peer = %self.uuid, ?state, ?msg, "message invalid in this state, closing");
                self.teardown_session(shared);
                self.state = SessionState::Idle;
                self.arm_timers();
            }
        }
    }

    fn on_pair_response(
        &mut self,
        shared: &mut Shared,
        key: &str,
        device: &DeviceInfo,
        agree: bool,
    ) {
        if agree && key == SCAN_KEY {
            info!(peer = %self.uuid, name = %device.name, "pair agreed");
            self.name = device.name.clone();
            self.os = device.os;
            self.compositor = device.compositor;
            self.enter_paired(shared);
        } else {
            info!(peer = %self.uuid, "pair refused by peer");
            self.close_connection();
            self.connected = false;
            self.state = SessionState::Idle;
            self.arm_timers();
        }
    }

    /// Service handlers, live only inside `Paired`.
    fn dispatch_paired(&mut self, shared: &mut Shared, msg: PeerMessage) {
        match msg {
            PeerMessage::ServiceOnOff {
                shared_clipboard_on,
                shared_devices_on,
            } => {
                debug!(
                    peer = %self.uuid,
                    clipboard = shared_clipboard_on,
                    devices = shared_devices_on,
                    "peer services"
                );
                self.remote_clipboard_on = shared_clipboard_on;
                self.remote_devices_on = shared_devices_on;
            }

            PeerMessage::DeviceSharingStartRequest => {
                let accept = shared.config.accept_device_sharing
                    && shared.try_acquire_sharing(&self.uuid, SharingRole::Sink);
                self.send_message(PeerMessage::DeviceSharingStartResponse { accept });
                if accept {
                    info!(peer = %self.uuid, "device sharing started, this side is sink");
                    self.device_sharing = true;
                    self.direction = FlowDirection::Left;
                    self.spawn_emittors(shared);
                } else {
                    debug!(peer = %self.uuid, "device sharing refused");
                }
            }

            PeerMessage::DeviceSharingStartResponse { accept } => {
                if !accept {
                    info!(peer = %self.uuid, "peer refused device sharing");
                    return;
                }
                if shared.try_acquire_sharing(&self.uuid, SharingRole::Source) {
                    info!(peer = %self.uuid, "device sharing started, this side is source");
                    self.device_sharing = true;
                    self.direction = FlowDirection::Right;
                    self.send_message(PeerMessage::FlowDirectionNtf {
                        direction: FlowDirection::Right,
                    });
                } else {
                    warn!(peer = %self.uuid, "sharing slot already taken, dropping accept");
                }
            }

            PeerMessage::DeviceSharingStopRequest | PeerMessage::DeviceSharingStopResponse => {
                self.stop_sharing(shared);
            }

            PeerMessage::InputEventRequest {
                serial,
                device_type,
                event_type,
                code,
                value,
            } => {
                let success = self
                    .input_emittors
                    .get(&device_type)
                    .map(|e| e.emit(event_type, code, value))
                    .unwrap_or(false);
                if !success {
                    debug!(peer = %self.uuid, ?device_type, serial, "input event not injected");
                }
                self.send_message(PeerMessage::InputEventResponse { serial, success });
            }

            PeerMessage::InputEventResponse { serial, success } => {
                if !success {
                    debug!(peer = %self.uuid, serial, "peer could not inject event");
                }
            }

            PeerMessage::FlowDirectionNtf { direction } => {
                self.direction = direction.opposite();
            }

            PeerMessage::FlowRequest { direction, x, y } => {
                shared.effects.push(Effect::FlowBack {
                    from: self.uuid.clone(),
                    direction,
                    x,
                    y,
                });
            }

            PeerMessage::FlowResponse { agree } => {
                debug!(peer = %self.uuid, agree, "flow response");
            }

            PeerMessage::FsRequest { serial } => {
                if self.fuse_server.is_some() {
                    self.send_message(PeerMessage::FsResponse {
                        serial,
                        accepted: false,
                        port: 0,
                    });
                    return;
                }
                match FuseServer::serve() {
                    Ok(server) => {
                        let port = server.port();
                        info!(peer = %self.uuid, port, "filesystem export started");
                        self.fuse_server = Some(server);
                        self.send_message(PeerMessage::FsResponse {
                            serial,
                            accepted: true,
                            port,
                        });
                    }
                    Err(e) => {
                        warn!(peer = %self.uuid, error = %e, "cannot start filesystem export");
                        self.send_message(PeerMessage::FsResponse {
                            serial,
                            accepted: false,
                            port: 0,
                        });
                    }
                }
            }

            PeerMessage::FsResponse {
                serial,
                accepted,
                port,
            } => {
                if !accepted || port == 0 {
                    debug!(peer = %self.uuid, serial, "filesystem export refused");
                    return;
                }
                if self.fuse_client.is_some() {
                    debug!(peer = %self.uuid, "already mounted, ignoring fs response");
                    return;
                }
                let addr = SocketAddr::new(self.ip, port);
                info!(peer = %self.uuid, addr = %addr, "mounting peer filesystem");
                self.fuse_client = Some(FuseClient::mount(addr, shared.mountpoint.clone()));
                self.mounted = true;
            }

            PeerMessage::FsSendFileRequest { serial, path } => {
                let Some(client) = &self.fuse_client else {
                    self.send_message(PeerMessage::FsSendFileResponse {
                        serial,
                        accepted: false,
                    });
                    return;
                };
                let src = client.mountpoint().join(path.trim_start_matches('/'));
                self.send_message(PeerMessage::FsSendFileResponse {
                    serial,
                    accepted: true,
                });
                copyfile::spawn_copy(
                    src,
                    shared.storage_dir.clone(),
                    self.uuid.clone(),
                    serial,
                    path,
                    shared.handle.clone(),
                );
            }

            PeerMessage::FsSendFileResponse { serial, accepted } => {
                debug!(peer = %self.uuid, serial, accepted, "file send response");
            }

            PeerMessage::FsSendFileResult {
                serial,
                path,
                result,
            } => {
                info!(peer = %self.uuid, serial, path, result, "file transfer finished on peer");
            }

            PeerMessage::ClipboardNotify { targets } => {
                self.shared_clipboard = true;
                let mut offered = targets.clone();
                if self.os != DeviceOs::Uos
                    && offered.iter().any(|t| t == TARGET_GNOME_COPIED_FILES)
                    && !offered.iter().any(|t| t == TARGET_URI_LIST)
                {
                    offered.push(TARGET_URI_LIST.to_string());
                }
                shared.clipboard_owner = Some(self.uuid.clone());
                debug!(peer = %self.uuid, targets = ?offered, "peer owns the clipboard");

                // Mirror the content over: fetch every target the peer
                // actually has. Synthesized targets are derived locally
                // when the content arrives.
                for target in targets {
                    self.send_message(PeerMessage::ClipboardGetContentRequest { target });
                }
            }

            PeerMessage::ClipboardGetContentRequest { target } => {
                shared.clipboard.read(target, self.uuid.clone());
            }

            PeerMessage::ClipboardGetContentResponse { target, content } => {
                let rewritten = rewrite_clipboard_paths(&content, &shared.mountpoint);
                let mut entries = vec![(target.clone(), rewritten.clone())];
                if target == TARGET_GNOME_COPIED_FILES && self.os != DeviceOs::Uos {
                    if let Some(path) = first_uri_path(&rewritten) {
                        entries.push((TARGET_URI_LIST.to_string(), path));
                    }
                }
                shared.clipboard.store(entries);
            }

            // Pairing messages have no business on an established session.
            msg @ (PeerMessage::PairRequest { .. } | PeerMessage::PairResponse { .. }) => {
                warn!(peer = %self.uuid, ?msg, "pair message on established session, closing");
                self.teardown_session(shared);
                self.state = SessionState::Idle;
                self.arm_timers();
            }
        }
    }

    // -----------------------------------------------------------------
    // Service control (manager-driven)
    // -----------------------------------------------------------------

    /// Asks the peer to become the sink of a sharing session.
    pub fn request_device_sharing(&mut self) {
        if self.state != SessionState::Paired {
            warn!(peer = %self.uuid, "cannot share devices, not paired");
            return;
        }
        self.send_message(PeerMessage::DeviceSharingStartRequest);
    }

    /// Ends the active sharing session from this side.
    pub fn stop_device_sharing(&mut self, shared: &mut Shared) {
        if self.device_sharing {
            self.send_message(PeerMessage::DeviceSharingStopRequest);
            self.stop_sharing(shared);
        }
    }

    fn stop_sharing(&mut self, shared: &mut Shared) {
        if self.device_sharing {
            info!(peer = %self.uuid, "device sharing stopped");
            self.device_sharing = false;
            self.input_emittors.clear();
            shared.release_sharing(&self.uuid);
        }
    }

    /// Asks the peer to expose its filesystem.
    pub fn request_fs_mount(&mut self) {
        let serial = self.next_serial();
        self.send_message(PeerMessage::FsRequest { serial });
    }

    /// Offers a file to the peer (the peer pulls it through its mount).
    pub fn offer_file(&mut self, path: String) {
        let serial = self.next_serial();
        self.send_message(PeerMessage::FsSendFileRequest { serial, path });
    }

    /// Reports a finished local copy back to the offering peer.
    pub fn send_copy_result(&mut self, serial: u32, path: String, result: bool) {
        self.send_message(PeerMessage::FsSendFileResult {
            serial,
            path,
            result,
        });
    }

    /// One injector per device type; a helper that fails to spawn just
    /// leaves its type unserved and input events answer `success=false`.
    fn spawn_emittors(&mut self, shared: &Shared) {
        for device_type in [
            InputDeviceType::Keyboard,
            InputDeviceType::Mouse,
            InputDeviceType::Touchpad,
        ] {
            match InputEmittor::spawn(shared.config.injector_command(), device_type) {
                Ok(emittor) => {
                    self.input_emittors.insert(device_type, emittor);
                }
                Err(e) => {
                    warn!(?device_type, error = %e, "cannot spawn injector");
                }
            }
        }
    }

    /// Installs an emittor directly. Test seam for the dispatcher path.
    #[cfg(test)]
    pub fn install_emittor(&mut self, device_type: InputDeviceType, emittor: InputEmittor) {
        self.input_emittors.insert(device_type, emittor);
    }
}

/// Rewrites clipboard content so paths resolve through the local mount:
/// `file://` URIs get the mountpoint spliced into their path, bare
/// absolute paths get it prefixed, anything else passes through.
fn rewrite_clipboard_paths(content: &str, mountpoint: &Path) -> String {
    let mp = mountpoint.to_string_lossy();
    content
        .split('\n')
        .map(|line| {
            if let Some(rest) = line.strip_prefix("file://") {
                format!("file://{mp}{rest}")
            } else if line.starts_with('/') {
                format!("{mp}{line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Path component of the first `file://` URI in the content, if any.
fn first_uri_path(content: &str) -> Option<String> {
    content
        .split('\n')
        .find_map(|line| line.strip_prefix("file://"))
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
