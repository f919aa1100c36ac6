//! Central manager — peer registry and daemon event loop.
//!
//! The `Manager` owns every [`Machine`] and runs the single event loop
//! that ties together:
//!
//! - **Discovery beacons**: create or refresh machines
//! - **Inbound connections**: parked until their `PairRequest` arrives
//! - **Session messages**: dispatched to the owning machine
//! - **Collaborator completions**: confirm decisions, copy results,
//!   clipboard reads — everything re-enters through one channel
//! - **Timer sweep**: discovery pings and offline expiry
//!
//! # Event Loop Architecture
//!
//! The loop multiplexes one `mpsc::Receiver<ManagerEvent>` with a
//! one-second sweep tick via `tokio::select!`:
//!
//! ```text
//! loop {
//!     select! {
//!         event => route to pending conn / machine / registry
//!         sweep tick => ping due peers, drop expired ones
//!     }
//! }
//! ```
//!
//! Every handler runs to completion on this task, so machine state is
//! never touched concurrently — collaborator tasks and threads re-enter
//! exclusively through the [`ManagerHandle`] wake channel. Cross-peer
//! rules live here too: at most one device-sharing session exists at a
//! time, and flow-back events are routed between machines after each
//! dispatch.

use crate::clipboard::ClipboardHandle;
use crate::conn::{ConnId, Connection};
use crate::discovery::DiscoveryHandle;
use crate::machine::{Machine, SessionState};
use crate::notifications::NotificationManager;
use lancoop_core::config::AppConfig;
use lancoop_core::protocol::PeerMessage;
use lancoop_core::types::{DeviceInfo, FlowDirection, PeerUuid};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Depth of the manager's event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Interval of the timer sweep. The discovery timers have 10 s / 25 s
/// granularity, so a one-second sweep is plenty.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Creates the manager's event channel. The [`ManagerHandle`] is the
/// only way anything outside the loop talks to the manager.
pub fn channel() -> (ManagerHandle, mpsc::Receiver<ManagerEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (ManagerHandle { tx }, rx)
}

/// Thread-safe wake handle: schedules an event onto the manager loop.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerEvent>,
}

impl ManagerHandle {
    /// Enqueues one event; fails only when the manager is gone.
    pub async fn send(
        &self,
        event: ManagerEvent,
    ) -> Result<(), mpsc::error::SendError<ManagerEvent>> {
        self.tx.send(event).await
    }
}

/// Everything that can happen to the daemon, serialized onto one loop.
#[derive(Debug)]
pub enum ManagerEvent {
    /// Discovery beacon received from `addr`.
    Beacon {
        addr: IpAddr,
        tcp_port: u16,
        device: DeviceInfo,
    },
    /// The session listener accepted a connection; identity unknown
    /// until its `PairRequest`.
    InboundConnected { conn: Connection },
    /// An outbound dial completed.
    OutboundConnected { uuid: PeerUuid, conn: Connection },
    /// An outbound dial failed.
    OutboundFailed { uuid: PeerUuid, error: String },
    /// One decoded frame from a connection, in arrival order.
    Message {
        conn_id: ConnId,
        message: PeerMessage,
    },
    /// A connection ended; `illegal` marks a framing violation.
    ConnectionClosed { conn_id: ConnId, illegal: bool },
    /// The confirm dialog reported the user's decision.
    ConfirmDecision { uuid: PeerUuid, accepted: bool },
    /// A file-copy child exited.
    CopyFinished {
        uuid: PeerUuid,
        serial: u32,
        path: String,
        success: bool,
    },
    /// The local clipboard changed.
    ClipboardChanged { targets: Vec<String> },
    /// A local clipboard read finished; reply to the requesting peer.
    ClipboardContent {
        uuid: PeerUuid,
        target: String,
        content: String,
    },
    /// Control-surface request (CLI today, desktop bus tomorrow).
    Command(Command),
    /// Stop the loop and drain every session.
    Shutdown,
}

/// Control requests against the daemon. Produced by the control surface
/// (desktop bus, future CLI verbs); the session core only consumes them.
#[derive(Debug)]
#[allow(dead_code)]
pub enum Command {
    /// Open the outgoing connection to a discovered peer.
    Connect { uuid: PeerUuid },
    /// Start forwarding our input to the peer.
    StartDeviceSharing { uuid: PeerUuid },
    /// End the active sharing session.
    StopDeviceSharing,
    /// Forget a peer entirely.
    Unpair { uuid: PeerUuid },
    /// Mount the peer's filesystem export.
    RequestFsMount { uuid: PeerUuid },
    /// Offer a file for the peer to pull through its mount.
    SendFile { uuid: PeerUuid, path: String },
    /// Flip the local service toggles and tell every paired peer.
    SetServices { clipboard: bool, devices: bool },
}

/// Which side of the active sharing session this daemon is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingRole {
    /// Our input is forwarded to the peer.
    Source,
    /// The peer's input is injected here.
    Sink,
}

/// The single device-sharing slot. Held by at most one machine.
#[derive(Debug)]
pub struct SharingSession {
    pub uuid: PeerUuid,
    pub role: SharingRole,
}

/// Cross-peer effect emitted by a machine handler, applied by the
/// manager after the dispatch returns.
#[derive(Debug)]
pub enum Effect {
    /// The shared cursor crossed a screen edge on the peer.
    FlowBack {
        from: PeerUuid,
        direction: FlowDirection,
        x: i32,
        y: i32,
    },
}

/// State and collaborators shared by the manager and every machine
/// handler. Split from the peer map so a machine can be borrowed
/// mutably alongside it.
pub struct Shared {
    pub config: AppConfig,
    pub local: DeviceInfo,
    pub storage_dir: PathBuf,
    pub mountpoint: PathBuf,
    pub discovery: DiscoveryHandle,
    pub clipboard: ClipboardHandle,
    pub notifier: NotificationManager,
    pub handle: ManagerHandle,
    /// The one device-sharing session allowed across all machines.
    pub sharing: Option<SharingSession>,
    /// Which peer currently owns the mirrored clipboard, if any.
    pub clipboard_owner: Option<PeerUuid>,
    /// Cross-peer effects accumulated during one dispatch.
    pub effects: Vec<Effect>,
}

impl Shared {
    /// Claims the sharing slot for `uuid`. Re-claiming by the holder is
    /// idempotent (the role may flip); anyone else is refused.
    pub fn try_acquire_sharing(&mut self, uuid: &PeerUuid, role: SharingRole) -> bool {
        if let Some(session) = &self.sharing {
            if &session.uuid != uuid {
                debug!(holder = %session.uuid, requester = %uuid, "sharing slot busy");
                return false;
            }
        }
        self.sharing = Some(SharingSession {
            uuid: uuid.clone(),
            role,
        });
        true
    }

    /// Releases the slot if `uuid` holds it.
    pub fn release_sharing(&mut self, uuid: &PeerUuid) {
        if self.sharing.as_ref().is_some_and(|s| &s.uuid == uuid) {
            self.sharing = None;
        }
    }
}

/// The daemon's core: peer registry plus event loop.
pub struct Manager {
    events_rx: mpsc::Receiver<ManagerEvent>,
    shared: Shared,
    peers: HashMap<PeerUuid, Machine>,
    /// Inbound connections waiting for their `PairRequest`.
    pending: HashMap<ConnId, Connection>,
    /// Connection → owning machine, maintained alongside the peer map.
    conn_index: HashMap<ConnId, PeerUuid>,
}

impl Manager {
    pub fn new(
        config: AppConfig,
        mountpoint: PathBuf,
        discovery: DiscoveryHandle,
        clipboard: ClipboardHandle,
        handle: ManagerHandle,
        events_rx: mpsc::Receiver<ManagerEvent>,
    ) -> Self {
        let local = config.device_info();
        let storage_dir = config.resolved_storage_dir();
        Self {
            events_rx,
            shared: Shared {
                config,
                local,
                storage_dir,
                mountpoint,
                discovery,
                clipboard,
                notifier: NotificationManager::new(),
                handle,
                sharing: None,
                clipboard_owner: None,
                effects: Vec::new(),
            },
            peers: HashMap::new(),
            pending: HashMap::new(),
            conn_index: HashMap::new(),
        }
    }

    /// Runs the event loop until shutdown, then drains every session.
    pub async fn run(mut self) {
        info!(
            device = %self.shared.local.uuid,
            name = %self.shared.local.name,
            "manager loop started"
        );

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break, // every handle dropped
                },
                _ = sweep.tick() => {
                    self.sweep_timers();
                    continue;
                }
            };

            if matches!(event, ManagerEvent::Shutdown) {
                info!("shutdown requested, draining sessions");
                break;
            }
            self.handle_event(event);
        }

        self.teardown();
    }

    /// Receives the next event. Split from [`Manager::run`] so tests can
    /// drive the loop one event at a time.
    #[cfg(test)]
    pub(crate) async fn next_event(&mut self) -> Option<ManagerEvent> {
        self.events_rx.recv().await
    }

    /// Routes one event. All machine state changes funnel through here.
    pub(crate) fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Beacon {
                addr,
                tcp_port,
                device,
            } => self.on_beacon(addr, tcp_port, device),

            ManagerEvent::InboundConnected { conn } => {
                debug!(conn = %conn.id(), "inbound connection parked until pair request");
                self.pending.insert(conn.id(), conn);
            }

            ManagerEvent::OutboundConnected { uuid, conn } => {
                let Some(machine) = self.peers.get_mut(&uuid) else {
                    debug!(peer = %uuid, "dial completed for removed peer");
                    conn.close();
                    return;
                };
                let conn_id = conn.id();
                machine.on_connected(&self.shared, conn);
                if machine.conn_id() == Some(conn_id) {
                    self.conn_index.insert(conn_id, uuid);
                }
            }

            ManagerEvent::OutboundFailed { uuid, error } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.on_connect_failed(&self.shared, &error);
                }
            }

            ManagerEvent::Message { conn_id, message } => self.on_message(conn_id, message),

            ManagerEvent::ConnectionClosed { conn_id, illegal } => {
                if illegal {
                    warn!(conn = %conn_id, "connection closed after illegal frame");
                }
                if self.pending.remove(&conn_id).is_some() {
                    return;
                }
                if let Some(uuid) = self.conn_index.remove(&conn_id) {
                    if let Some(machine) = self.peers.get_mut(&uuid) {
                        if machine.conn_id() == Some(conn_id) {
                            machine.on_closed(&mut self.shared);
                        }
                    }
                }
            }

            ManagerEvent::ConfirmDecision { uuid, accepted } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.on_confirm(&mut self.shared, accepted);
                }
                self.reconcile_conn_index();
            }

            ManagerEvent::CopyFinished {
                uuid,
                serial,
                path,
                success,
            } => {
                self.shared.notifier.notify_transfer_result(&path, success);
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.send_copy_result(serial, path, success);
                } else {
                    debug!(peer = %uuid, serial, "copy finished for removed peer");
                }
            }

            ManagerEvent::ClipboardChanged { targets } => {
                // We own the clipboard now; paired peers get notified and
                // will fetch content on demand.
                if let Some(prev) = self.shared.clipboard_owner.take() {
                    debug!(peer = %prev, "clipboard ownership returns to this device");
                }
                for machine in self.peers.values_mut() {
                    if machine.connected() {
                        machine.send_message(PeerMessage::ClipboardNotify {
                            targets: targets.clone(),
                        });
                    }
                }
            }

            ManagerEvent::ClipboardContent {
                uuid,
                target,
                content,
            } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    if machine.connected() {
                        machine.send_message(PeerMessage::ClipboardGetContentResponse {
                            target,
                            content,
                        });
                    }
                }
            }

            ManagerEvent::Command(command) => self.on_command(command),

            // Intercepted by the run loop; a stray one is harmless here.
            ManagerEvent::Shutdown => {}
        }
        self.drain_effects();
    }

    fn on_beacon(&mut self, addr: IpAddr, tcp_port: u16, device: DeviceInfo) {
        if device.uuid == self.shared.local.uuid {
            return;
        }
        match self.peers.get_mut(&device.uuid) {
            Some(machine) => {
                machine.update_info(addr, tcp_port, &device);
                machine.received_ping();
            }
            None => {
                info!(
                    peer = %device.uuid,
                    name = %device.name,
                    addr = %addr,
                    tcp_port,
                    "peer discovered"
                );
                let machine = Machine::new(device.clone(), addr, tcp_port);
                self.peers.insert(device.uuid, machine);
            }
        }
    }

    fn on_message(&mut self, conn_id: ConnId, message: PeerMessage) {
        if let Some(uuid) = self.conn_index.get(&conn_id).cloned() {
            if let Some(machine) = self.peers.get_mut(&uuid) {
                machine.handle_message(&mut self.shared, message);
            }
            self.reconcile_conn_index();
            return;
        }

        if let Some(conn) = self.pending.remove(&conn_id) {
            self.on_pending_message(conn, message);
            return;
        }

        debug!(conn = %conn_id, "message for unknown connection dropped");
    }

    /// First frame on an anonymous inbound connection. Anything but a
    /// `PairRequest` is a protocol violation.
    fn on_pending_message(&mut self, conn: Connection, message: PeerMessage) {
        let PeerMessage::PairRequest { key, device } = message else {
            warn!(conn = %conn.id(), "inbound connection spoke before pairing, closing");
            conn.close();
            return;
        };

        if device.uuid == self.shared.local.uuid {
            warn!("pair request carrying our own uuid, closing");
            conn.close();
            return;
        }

        if let Some(machine) = self.peers.get_mut(&device.uuid) {
            match machine.state() {
                // Simultaneous-dial tie-break: the side with the lower
                // uuid keeps its outbound attempt and refuses the
                // inbound one.
                SessionState::Connecting | SessionState::AwaitingPair => {
                    if self.shared.local.uuid < device.uuid {
                        debug!(peer = %device.uuid, "dial race, keeping our outbound attempt");
                        Machine::refuse_pair(&conn, &self.shared);
                        return;
                    }
                    machine.abandon_dial();
                }
                // A peer re-pairing supersedes whatever session it had.
                SessionState::Paired | SessionState::AwaitingUserConfirm => {
                    debug!(peer = %device.uuid, "peer re-pairing, dropping previous session");
                    machine.on_closed(&mut self.shared);
                }
                SessionState::Idle => {}
            }
        }

        let ip = conn
            .peer_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let conn_id = conn.id();
        let uuid = device.uuid.clone();

        let machine = self
            .peers
            .entry(uuid.clone())
            .or_insert_with(|| Machine::new(device.clone(), ip, 0));
        machine.on_inbound_pair_request(&self.shared, conn, &key, &device);
        if machine.conn_id() == Some(conn_id) {
            self.conn_index.insert(conn_id, uuid);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { uuid } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.connect(&self.shared);
                } else {
                    warn!(peer = %uuid, "connect requested for unknown peer");
                }
            }

            Command::StartDeviceSharing { uuid } => {
                if let Some(session) = &self.shared.sharing {
                    warn!(
                        holder = %session.uuid,
                        role = ?session.role,
                        requested = %uuid,
                        "device sharing already active, request refused"
                    );
                    return;
                }
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.request_device_sharing();
                }
            }

            Command::StopDeviceSharing => {
                let holder = self.shared.sharing.as_ref().map(|s| s.uuid.clone());
                if let Some(uuid) = holder {
                    if let Some(machine) = self.peers.get_mut(&uuid) {
                        machine.stop_device_sharing(&mut self.shared);
                    }
                }
            }

            Command::Unpair { uuid } => {
                if let Some(mut machine) = self.peers.remove(&uuid) {
                    info!(peer = %uuid, "unpairing");
                    machine.teardown_session(&mut self.shared);
                }
                self.reconcile_conn_index();
            }

            Command::RequestFsMount { uuid } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.request_fs_mount();
                }
            }

            Command::SendFile { uuid, path } => {
                if let Some(machine) = self.peers.get_mut(&uuid) {
                    machine.offer_file(path);
                }
            }

            Command::SetServices { clipboard, devices } => {
                self.shared.config.shared_clipboard_on = clipboard;
                self.shared.config.shared_devices_on = devices;
                for machine in self.peers.values_mut() {
                    if machine.connected() {
                        machine.send_message(PeerMessage::ServiceOnOff {
                            shared_clipboard_on: clipboard,
                            shared_devices_on: devices,
                        });
                    }
                }
            }
        }
    }

    /// Applies cross-peer effects accumulated during a dispatch.
    fn drain_effects(&mut self) {
        let effects = std::mem::take(&mut self.shared.effects);
        for effect in effects {
            match effect {
                Effect::FlowBack {
                    from,
                    direction,
                    x,
                    y,
                } => {
                    // The cursor crossed back to this device; the input
                    // capture collaborator reclaims the pointer. Agreement
                    // requires an actual sharing session with the
                    // requester.
                    let agree = self
                        .shared
                        .sharing
                        .as_ref()
                        .is_some_and(|s| s.uuid == from);
                    info!(peer = %from, ?direction, x, y, agree, "pointer flow back");
                    if let Some(machine) = self.peers.get_mut(&from) {
                        machine.send_message(PeerMessage::FlowResponse { agree });
                    }
                }
            }
        }
    }

    /// Timer sweep: pings due peers, removes the ones past their offline
    /// window.
    pub(crate) fn sweep_timers(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (uuid, machine) in self.peers.iter_mut() {
            if machine.sweep(now, &self.shared) {
                expired.push(uuid.clone());
            }
        }
        for uuid in expired {
            if let Some(mut machine) = self.peers.remove(&uuid) {
                info!(peer = %uuid, name = %machine.name(), "peer offline, removed");
                machine.teardown_session(&mut self.shared);
            }
        }
        self.reconcile_conn_index();
    }

    /// Drops index entries whose machine no longer owns the connection.
    fn reconcile_conn_index(&mut self) {
        let peers = &self.peers;
        self.conn_index.retain(|conn_id, uuid| {
            peers
                .get(&*uuid)
                .is_some_and(|m| m.conn_id() == Some(*conn_id))
        });
    }

    /// Drains every session on shutdown; timers, connections, and
    /// wrappers are all closed before the machines drop.
    fn teardown(&mut self) {
        for (uuid, mut machine) in std::mem::take(&mut self.peers) {
            debug!(peer = %uuid, "draining session");
            machine.teardown_session(&mut self.shared);
        }
        self.pending.clear();
        self.conn_index.clear();
        info!("manager stopped");
    }

    // -----------------------------------------------------------------
    // Test access
    // -----------------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn peer(&self, uuid: &PeerUuid) -> Option<&Machine> {
        self.peers.get(uuid)
    }

    #[cfg(test)]
    pub(crate) fn peer_mut(&mut self, uuid: &PeerUuid) -> Option<&mut Machine> {
        self.peers.get_mut(uuid)
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Discovery;
    use crate::input::InputEmittor;
    use crate::machine::{TARGET_GNOME_COPIED_FILES, TARGET_URI_LIST};
    use lancoop_core::buffer::RecvBuffer;
    use lancoop_core::protocol::{self, Decoded};
    use lancoop_core::types::{Compositor, DeviceOs, InputDeviceType, SCAN_KEY};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    const PUMP_TIMEOUT: Duration = Duration::from_secs(2);

    struct TestDaemon {
        mgr: Manager,
        handle: ManagerHandle,
    }

    async fn daemon() -> TestDaemon {
        daemon_with_uuid("local-uuid").await
    }

    async fn daemon_with_uuid(uuid: &str) -> TestDaemon {
        let (handle, rx) = channel();
        let mut config = AppConfig::new_first_run("Local Device");
        config.device_uuid = uuid.to_string();
        // A helper that exists everywhere and writes no decision byte:
        // the tests inject decisions directly, and the dialog's silent
        // exit is dropped as a stale rejection.
        config.confirm_command = Some("/bin/true".to_string());
        config.storage_dir = Some(std::env::temp_dir().join("lancoop-test-inbox"));

        let local = config.device_info();
        let discovery = Discovery::bind(0, local, 0).expect("bind discovery");
        let clipboard = ClipboardHandle::start(handle.clone());

        let mut mgr = Manager::new(
            config,
            PathBuf::from("/data/mp"),
            discovery.handle(),
            clipboard,
            handle.clone(),
            rx,
        );
        mgr.shared.notifier.set_enabled(false);
        TestDaemon { mgr, handle }
    }

    /// The remote end of a session connection, speaking real frames.
    struct WirePeer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        buf: RecvBuffer,
    }

    impl WirePeer {
        async fn send(&mut self, msg: &PeerMessage) {
            let frame = protocol::encode(msg).unwrap();
            self.writer.write_all(&frame).await.unwrap();
        }

        /// Reads the next frame, or `None` on EOF / timeout.
        async fn recv(&mut self) -> Option<PeerMessage> {
            loop {
                match protocol::decode(&mut self.buf) {
                    Decoded::Message(msg) => return Some(msg),
                    Decoded::Partial => {}
                    Decoded::Illegal => return None,
                }
                let mut chunk = [0u8; 1024];
                match timeout(PUMP_TIMEOUT, self.reader.read(&mut chunk)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return None,
                    Ok(Ok(n)) => self.buf.extend(&chunk[..n]),
                }
            }
        }

        /// Asserts that nothing more arrives within a short window.
        async fn expect_silence(&mut self) {
            let mut chunk = [0u8; 1024];
            match timeout(Duration::from_millis(200), self.reader.read(&mut chunk)).await {
                Err(_) => {}     // timed out: silence, as expected
                Ok(Ok(0)) => {}  // closed: also silence
                Ok(Ok(n)) => panic!("expected silence, got {n} bytes"),
                Ok(Err(_)) => {}
            }
        }
    }

    /// Wires an inbound connection into the daemon, returning the remote
    /// end.
    fn inbound(d: &mut TestDaemon) -> WirePeer {
        let (daemon_end, peer_end) = tokio::io::duplex(16384);
        let (dr, dw) = tokio::io::split(daemon_end);
        let conn = Connection::spawn_parts(dr, dw, None, d.handle.clone());
        d.mgr.handle_event(ManagerEvent::InboundConnected { conn });
        let (pr, pw) = tokio::io::split(peer_end);
        WirePeer {
            reader: pr,
            writer: pw,
            buf: RecvBuffer::new(),
        }
    }

    async fn pump_until(d: &mut TestDaemon, desc: &str, cond: impl Fn(&Manager) -> bool) {
        for _ in 0..100 {
            if cond(&d.mgr) {
                return;
            }
            let event = timeout(PUMP_TIMEOUT, d.mgr.next_event())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for: {desc}"))
                .expect("event channel closed");
            d.mgr.handle_event(event);
        }
        panic!("never reached: {desc}");
    }

    /// Handles every event that arrives within a short quiet window.
    async fn drain_events(d: &mut TestDaemon) {
        while let Ok(Some(event)) =
            timeout(Duration::from_millis(100), d.mgr.next_event()).await
        {
            d.mgr.handle_event(event);
        }
    }

    /// Reads the peer's next frame while keeping the manager loop fed —
    /// replies only hit the wire once their triggering event is handled.
    async fn recv_pumped(d: &mut TestDaemon, peer: &mut WirePeer) -> Option<PeerMessage> {
        loop {
            tokio::select! {
                biased;
                msg = peer.recv() => break msg,
                event = d.mgr.next_event() => match event {
                    Some(event) => d.mgr.handle_event(event),
                    None => break None,
                },
            }
        }
    }

    fn remote_device(uuid: &str, os: DeviceOs) -> DeviceInfo {
        DeviceInfo {
            uuid: PeerUuid::new(uuid),
            name: format!("Peer-{uuid}"),
            os,
            compositor: Compositor::X11,
        }
    }

    /// A real listener for outbound-dial tests. The kernel completes the
    /// connect from its backlog, so the machine's background dial neither
    /// fails nor races the test.
    async fn parked_listener() -> (tokio::net::TcpListener, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let port = listener.local_addr().expect("listener addr").port();
        (listener, port)
    }

    /// Full inbound handshake: pair request, user accepts, both
    /// post-pair frames drained off the wire.
    async fn pair_inbound(d: &mut TestDaemon, uuid: &str, os: DeviceOs) -> WirePeer {
        let mut peer = inbound(d);
        peer.send(&PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: remote_device(uuid, os),
        })
        .await;

        let id = PeerUuid::new(uuid);
        pump_until(d, "awaiting user confirm", |m| {
            m.peer(&id)
                .is_some_and(|p| p.state() == SessionState::AwaitingUserConfirm)
        })
        .await;

        d.mgr.handle_event(ManagerEvent::ConfirmDecision {
            uuid: id.clone(),
            accepted: true,
        });
        assert_eq!(d.mgr.peer(&id).unwrap().state(), SessionState::Paired);

        match peer.recv().await {
            Some(PeerMessage::PairResponse { agree, .. }) => assert!(agree),
            other => panic!("expected PairResponse, got {other:?}"),
        }
        match peer.recv().await {
            Some(PeerMessage::ServiceOnOff { .. }) => {}
            other => panic!("expected ServiceOnOff, got {other:?}"),
        }
        peer
    }

    // -- Handshake ---------------------------------------------------

    #[tokio::test]
    async fn inbound_handshake_accept() {
        let mut d = daemon().await;
        let mut peer = inbound(&mut d);
        peer.send(&PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: remote_device("peer-a", DeviceOs::Linux),
        })
        .await;

        let id = PeerUuid::new("peer-a");
        pump_until(&mut d, "awaiting user confirm", |m| {
            m.peer(&id)
                .is_some_and(|p| p.state() == SessionState::AwaitingUserConfirm)
        })
        .await;

        d.mgr.handle_event(ManagerEvent::ConfirmDecision {
            uuid: id.clone(),
            accepted: true,
        });

        let machine = d.mgr.peer(&id).unwrap();
        assert_eq!(machine.state(), SessionState::Paired);
        assert!(machine.connected());

        match peer.recv().await {
            Some(PeerMessage::PairResponse { key, agree, .. }) => {
                assert_eq!(key, SCAN_KEY);
                assert!(agree);
            }
            other => panic!("expected PairResponse, got {other:?}"),
        }
        match peer.recv().await {
            Some(PeerMessage::ServiceOnOff {
                shared_clipboard_on,
                shared_devices_on,
            }) => {
                assert!(!shared_clipboard_on);
                assert!(!shared_devices_on);
            }
            other => panic!("expected ServiceOnOff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inbound_handshake_reject() {
        let mut d = daemon().await;
        let mut peer = inbound(&mut d);
        peer.send(&PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: remote_device("peer-a", DeviceOs::Linux),
        })
        .await;

        let id = PeerUuid::new("peer-a");
        pump_until(&mut d, "awaiting user confirm", |m| {
            m.peer(&id)
                .is_some_and(|p| p.state() == SessionState::AwaitingUserConfirm)
        })
        .await;

        d.mgr.handle_event(ManagerEvent::ConfirmDecision {
            uuid: id.clone(),
            accepted: false,
        });

        let machine = d.mgr.peer(&id).unwrap();
        assert_eq!(machine.state(), SessionState::Idle);
        assert!(!machine.connected());

        match peer.recv().await {
            Some(PeerMessage::PairResponse { agree, .. }) => assert!(!agree),
            other => panic!("expected PairResponse, got {other:?}"),
        }
        // The daemon closes the stream after the refusal.
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn wrong_scan_key_is_refused_without_dialog() {
        let mut d = daemon().await;
        let mut peer = inbound(&mut d);
        peer.send(&PeerMessage::PairRequest {
            key: "SOMETHING-ELSE".to_string(),
            device: remote_device("peer-a", DeviceOs::Linux),
        })
        .await;

        let id = PeerUuid::new("peer-a");
        pump_until(&mut d, "machine created", |m| m.peer(&id).is_some()).await;
        assert_eq!(d.mgr.peer(&id).unwrap().state(), SessionState::Idle);

        match peer.recv().await {
            Some(PeerMessage::PairResponse { agree, .. }) => assert!(!agree),
            other => panic!("expected PairResponse, got {other:?}"),
        }
        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn outbound_handshake_matches_inbound() {
        let mut d = daemon().await;
        let id = PeerUuid::new("peer-b");

        // Known from a beacon. The background dial lands in a parked
        // listener; the injected connection below wins the race because
        // no event is pumped in between.
        let (_listener, port) = parked_listener().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([127, 0, 0, 1]),
            tcp_port: port,
            device: remote_device("peer-b", DeviceOs::Linux),
        });
        d.mgr
            .handle_event(ManagerEvent::Command(Command::Connect { uuid: id.clone() }));
        assert_eq!(d.mgr.peer(&id).unwrap().state(), SessionState::Connecting);

        // Hand the machine an established connection, as the dial task
        // would.
        let (daemon_end, peer_end) = tokio::io::duplex(16384);
        let (dr, dw) = tokio::io::split(daemon_end);
        let conn = Connection::spawn_parts(dr, dw, None, d.handle.clone());
        d.mgr.handle_event(ManagerEvent::OutboundConnected {
            uuid: id.clone(),
            conn,
        });
        assert_eq!(d.mgr.peer(&id).unwrap().state(), SessionState::AwaitingPair);

        let (pr, pw) = tokio::io::split(peer_end);
        let mut peer = WirePeer {
            reader: pr,
            writer: pw,
            buf: RecvBuffer::new(),
        };

        match peer.recv().await {
            Some(PeerMessage::PairRequest { key, device }) => {
                assert_eq!(key, SCAN_KEY);
                assert_eq!(device.uuid, PeerUuid::new("local-uuid"));
            }
            other => panic!("expected PairRequest, got {other:?}"),
        }

        peer.send(&PeerMessage::PairResponse {
            key: SCAN_KEY.to_string(),
            device: remote_device("peer-b", DeviceOs::Linux),
            agree: true,
        })
        .await;

        pump_until(&mut d, "paired", |m| {
            m.peer(&id).is_some_and(|p| p.state() == SessionState::Paired)
        })
        .await;
        assert!(d.mgr.peer(&id).unwrap().connected());

        // Both consent paths end with the same notification.
        match peer.recv().await {
            Some(PeerMessage::ServiceOnOff {
                shared_clipboard_on,
                shared_devices_on,
            }) => {
                assert!(!shared_clipboard_on);
                assert!(!shared_devices_on);
            }
            other => panic!("expected ServiceOnOff, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pair_refusal_returns_to_idle() {
        let mut d = daemon().await;
        let id = PeerUuid::new("peer-b");
        let (_listener, port) = parked_listener().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([127, 0, 0, 1]),
            tcp_port: port,
            device: remote_device("peer-b", DeviceOs::Linux),
        });
        d.mgr
            .handle_event(ManagerEvent::Command(Command::Connect { uuid: id.clone() }));

        let (daemon_end, peer_end) = tokio::io::duplex(16384);
        let (dr, dw) = tokio::io::split(daemon_end);
        let conn = Connection::spawn_parts(dr, dw, None, d.handle.clone());
        d.mgr.handle_event(ManagerEvent::OutboundConnected {
            uuid: id.clone(),
            conn,
        });

        let (pr, pw) = tokio::io::split(peer_end);
        let mut peer = WirePeer {
            reader: pr,
            writer: pw,
            buf: RecvBuffer::new(),
        };
        assert!(matches!(
            peer.recv().await,
            Some(PeerMessage::PairRequest { .. })
        ));

        peer.send(&PeerMessage::PairResponse {
            key: SCAN_KEY.to_string(),
            device: remote_device("peer-b", DeviceOs::Linux),
            agree: false,
        })
        .await;

        pump_until(&mut d, "back to idle", |m| {
            m.peer(&id).is_some_and(|p| p.state() == SessionState::Idle)
        })
        .await;
        assert!(!d.mgr.peer(&id).unwrap().connected());
    }

    // -- Dispatcher services -----------------------------------------

    #[tokio::test]
    async fn input_forwarding_reaches_the_emittor() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;
        let id = PeerUuid::new("peer-a");

        // Peer takes the source role; this side becomes the sink.
        peer.send(&PeerMessage::DeviceSharingStartRequest).await;
        pump_until(&mut d, "sharing active", |m| {
            m.peer(&id).is_some_and(|p| p.device_sharing())
        })
        .await;
        match peer.recv().await {
            Some(PeerMessage::DeviceSharingStartResponse { accept }) => assert!(accept),
            other => panic!("expected DeviceSharingStartResponse, got {other:?}"),
        }
        assert_eq!(d.mgr.peer(&id).unwrap().direction(), FlowDirection::Left);

        // Stand in for the injector child.
        let (writer, mut injected) = tokio::io::duplex(256);
        d.mgr
            .peer_mut(&id)
            .unwrap()
            .install_emittor(InputDeviceType::Mouse, InputEmittor::from_writer(writer));

        peer.send(&PeerMessage::InputEventRequest {
            serial: 7,
            device_type: InputDeviceType::Mouse,
            event_type: 2,
            code: 0,
            value: 5,
        })
        .await;

        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::InputEventResponse { serial, success }) => {
                assert_eq!(serial, 7);
                assert!(success);
            }
            other => panic!("expected InputEventResponse, got {other:?}"),
        }

        let mut triple = [0u8; 12];
        injected.read_exact(&mut triple).await.unwrap();
        assert_eq!(&triple[0..4], &2u32.to_ne_bytes());
        assert_eq!(&triple[4..8], &0u32.to_ne_bytes());
        assert_eq!(&triple[8..12], &5i32.to_ne_bytes());
    }

    #[tokio::test]
    async fn concatenated_frames_dispatch_in_order() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        // Two frames in a single socket write must invoke their handlers
        // in order, exactly once each.
        let mut wire = Vec::new();
        for serial in [1u32, 2] {
            wire.extend_from_slice(
                &protocol::encode(&PeerMessage::InputEventRequest {
                    serial,
                    device_type: InputDeviceType::Keyboard,
                    event_type: 1,
                    code: 30,
                    value: 1,
                })
                .unwrap(),
            );
        }
        peer.writer.write_all(&wire).await.unwrap();

        for expected in [1u32, 2] {
            match recv_pumped(&mut d, &mut peer).await {
                Some(PeerMessage::InputEventResponse { serial, .. }) => {
                    assert_eq!(serial, expected);
                }
                other => panic!("expected InputEventResponse, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn input_event_without_emittor_fails() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        peer.send(&PeerMessage::InputEventRequest {
            serial: 11,
            device_type: InputDeviceType::Touchpad,
            event_type: 3,
            code: 1,
            value: 9,
        })
        .await;

        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::InputEventResponse { serial, success }) => {
                assert_eq!(serial, 11);
                assert!(!success);
            }
            other => panic!("expected InputEventResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn device_sharing_is_mutually_exclusive() {
        let mut d = daemon().await;
        let mut peer_b = pair_inbound(&mut d, "peer-b", DeviceOs::Linux).await;
        let mut peer_c = pair_inbound(&mut d, "peer-c", DeviceOs::Linux).await;
        let id_b = PeerUuid::new("peer-b");
        let id_c = PeerUuid::new("peer-c");

        // Share with B: request goes out, B accepts, slot taken.
        d.mgr
            .handle_event(ManagerEvent::Command(Command::StartDeviceSharing {
                uuid: id_b.clone(),
            }));
        assert!(matches!(
            peer_b.recv().await,
            Some(PeerMessage::DeviceSharingStartRequest)
        ));
        peer_b
            .send(&PeerMessage::DeviceSharingStartResponse { accept: true })
            .await;
        pump_until(&mut d, "sharing with B", |m| {
            m.peer(&id_b).is_some_and(|p| p.device_sharing())
        })
        .await;
        assert_eq!(d.mgr.peer(&id_b).unwrap().direction(), FlowDirection::Right);
        assert!(matches!(
            peer_b.recv().await,
            Some(PeerMessage::FlowDirectionNtf {
                direction: FlowDirection::Right
            })
        ));

        // Starting a second session toward C is refused locally: C never
        // even sees a request.
        d.mgr
            .handle_event(ManagerEvent::Command(Command::StartDeviceSharing {
                uuid: id_c.clone(),
            }));
        peer_c.expect_silence().await;

        // Even a hostile accept from C cannot take the slot.
        peer_c
            .send(&PeerMessage::DeviceSharingStartResponse { accept: true })
            .await;
        drain_events(&mut d).await;

        let sharing: Vec<_> = [&id_b, &id_c]
            .into_iter()
            .filter(|id| d.mgr.peer(id).is_some_and(|p| p.device_sharing()))
            .collect();
        assert_eq!(sharing.len(), 1, "exactly one machine may share");
        assert!(d.mgr.peer(&id_b).unwrap().device_sharing());
        assert!(!d.mgr.peer(&id_c).unwrap().device_sharing());
    }

    #[tokio::test]
    async fn inbound_sharing_refused_while_slot_taken() {
        let mut d = daemon().await;
        let mut peer_b = pair_inbound(&mut d, "peer-b", DeviceOs::Linux).await;
        let mut peer_c = pair_inbound(&mut d, "peer-c", DeviceOs::Linux).await;
        let id_b = PeerUuid::new("peer-b");

        peer_b.send(&PeerMessage::DeviceSharingStartRequest).await;
        pump_until(&mut d, "B is sharing", |m| {
            m.peer(&id_b).is_some_and(|p| p.device_sharing())
        })
        .await;
        assert!(matches!(
            peer_b.recv().await,
            Some(PeerMessage::DeviceSharingStartResponse { accept: true })
        ));

        peer_c.send(&PeerMessage::DeviceSharingStartRequest).await;
        match recv_pumped(&mut d, &mut peer_c).await {
            Some(PeerMessage::DeviceSharingStartResponse { accept }) => assert!(!accept),
            other => panic!("expected refusal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sharing_collapses_when_the_stream_closes() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-b", DeviceOs::Linux).await;
        let id = PeerUuid::new("peer-b");

        peer.send(&PeerMessage::DeviceSharingStartRequest).await;
        pump_until(&mut d, "sharing active", |m| {
            m.peer(&id).is_some_and(|p| p.device_sharing())
        })
        .await;
        assert!(d.mgr.shared().sharing.is_some());

        // The peer vanishes: dropping its ends closes the stream.
        drop(peer);
        pump_until(&mut d, "session collapsed", |m| {
            m.peer(&id).is_some_and(|p| p.state() == SessionState::Idle)
        })
        .await;

        let machine = d.mgr.peer(&id).unwrap();
        assert!(!machine.connected());
        assert!(
            !machine.device_sharing(),
            "deviceSharing must imply connected"
        );
        assert!(d.mgr.shared().sharing.is_none(), "slot must be released");
    }

    #[tokio::test]
    async fn file_send_without_mount_is_refused() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        peer.send(&PeerMessage::FsSendFileRequest {
            serial: 3,
            path: "/x.txt".to_string(),
        })
        .await;

        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::FsSendFileResponse { serial, accepted }) => {
                assert_eq!(serial, 3);
                assert!(!accepted);
            }
            other => panic!("expected FsSendFileResponse, got {other:?}"),
        }
        // No result may follow a refusal.
        peer.expect_silence().await;
    }

    #[tokio::test]
    async fn fs_request_starts_one_export_only() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        peer.send(&PeerMessage::FsRequest { serial: 1 }).await;
        let first_port = match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::FsResponse {
                serial,
                accepted,
                port,
            }) => {
                assert_eq!(serial, 1);
                assert!(accepted);
                assert_ne!(port, 0);
                port
            }
            other => panic!("expected FsResponse, got {other:?}"),
        };

        // A second request while the export runs is refused.
        peer.send(&PeerMessage::FsRequest { serial: 2 }).await;
        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::FsResponse {
                serial,
                accepted,
                port,
            }) => {
                assert_eq!(serial, 2);
                assert!(!accepted);
                assert_eq!(port, 0);
            }
            other => panic!("expected FsResponse, got {other:?}"),
        }
        assert_ne!(first_port, 0);
    }

    // -- Clipboard ---------------------------------------------------

    #[tokio::test]
    async fn clipboard_notify_marks_owner_and_fetches_content() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;
        let id = PeerUuid::new("peer-a");

        peer.send(&PeerMessage::ClipboardNotify {
            targets: vec![TARGET_GNOME_COPIED_FILES.to_string()],
        })
        .await;

        pump_until(&mut d, "clipboard owner set", |m| {
            m.shared().clipboard_owner.as_ref() == Some(&id)
        })
        .await;
        assert!(d.mgr.peer(&id).unwrap().shared_clipboard());

        match peer.recv().await {
            Some(PeerMessage::ClipboardGetContentRequest { target }) => {
                assert_eq!(target, TARGET_GNOME_COPIED_FILES);
            }
            other => panic!("expected ClipboardGetContentRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clipboard_content_is_rewritten_through_the_mountpoint() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        peer.send(&PeerMessage::ClipboardGetContentResponse {
            target: TARGET_GNOME_COPIED_FILES.to_string(),
            content: "copy\nfile:///docs/x\n/abs/y\n".to_string(),
        })
        .await;

        // Process the response, then let the store job land in the
        // clipboard task.
        drain_events(&mut d).await;

        let clipboard = d.mgr.shared().clipboard.clone();
        let mut stored = clipboard.get(TARGET_GNOME_COPIED_FILES).await;
        for _ in 0..50 {
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            stored = clipboard.get(TARGET_GNOME_COPIED_FILES).await;
        }
        assert_eq!(
            stored.as_deref(),
            Some("copy\nfile:///data/mp/docs/x\n/data/mp/abs/y\n")
        );

        let uri_list = clipboard.get(TARGET_URI_LIST).await;
        assert_eq!(uri_list.as_deref(), Some("/data/mp/docs/x"));
    }

    #[tokio::test]
    async fn local_clipboard_change_notifies_paired_peers() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        d.mgr.handle_event(ManagerEvent::ClipboardChanged {
            targets: vec!["text/plain".to_string()],
        });

        match peer.recv().await {
            Some(PeerMessage::ClipboardNotify { targets }) => {
                assert_eq!(targets, vec!["text/plain"]);
            }
            other => panic!("expected ClipboardNotify, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clipboard_read_request_is_served() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-a", DeviceOs::Linux).await;

        // Seed the local clipboard store.
        d.mgr.shared().clipboard.store(vec![(
            "text/plain".to_string(),
            "hello from here".to_string(),
        )]);
        tokio::task::yield_now().await;

        peer.send(&PeerMessage::ClipboardGetContentRequest {
            target: "text/plain".to_string(),
        })
        .await;

        // The read goes machine → bridge → manager → machine; pump until
        // the response hits the wire.
        let response = loop {
            tokio::select! {
                msg = peer.recv() => break msg,
                event = d.mgr.next_event() => {
                    d.mgr.handle_event(event.expect("event channel closed"));
                }
            }
        };
        match response {
            Some(PeerMessage::ClipboardGetContentResponse { target, content }) => {
                assert_eq!(target, "text/plain");
                assert_eq!(content, "hello from here");
            }
            other => panic!("expected ClipboardGetContentResponse, got {other:?}"),
        }
    }

    // -- Flow --------------------------------------------------------

    #[tokio::test]
    async fn flow_request_is_answered_by_the_manager() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-b", DeviceOs::Linux).await;
        let id = PeerUuid::new("peer-b");

        // Establish a sharing session with B first.
        peer.send(&PeerMessage::DeviceSharingStartRequest).await;
        pump_until(&mut d, "sharing", |m| {
            m.peer(&id).is_some_and(|p| p.device_sharing())
        })
        .await;
        assert!(matches!(
            peer.recv().await,
            Some(PeerMessage::DeviceSharingStartResponse { accept: true })
        ));

        peer.send(&PeerMessage::FlowRequest {
            direction: FlowDirection::Right,
            x: 0,
            y: 540,
        })
        .await;

        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::FlowResponse { agree }) => assert!(agree),
            other => panic!("expected FlowResponse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn flow_direction_is_mirrored() {
        let mut d = daemon().await;
        let mut peer = pair_inbound(&mut d, "peer-b", DeviceOs::Linux).await;
        let id = PeerUuid::new("peer-b");

        peer.send(&PeerMessage::FlowDirectionNtf {
            direction: FlowDirection::Right,
        })
        .await;

        pump_until(&mut d, "direction mirrored", |m| {
            m.peer(&id).is_some_and(|p| p.direction() == FlowDirection::Left)
        })
        .await;
    }

    // -- Liveness ----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_removed_after_the_offline_window() {
        let mut d = daemon().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([192, 168, 1, 20]),
            tcp_port: 4050,
            device: remote_device("peer-a", DeviceOs::Linux),
        });
        assert_eq!(d.mgr.peer_count(), 1);

        tokio::time::advance(Duration::from_secs(26)).await;
        d.mgr.sweep_timers();
        assert_eq!(d.mgr.peer_count(), 0, "silent peer should be removed");
    }

    #[tokio::test(start_paused = true)]
    async fn beacons_keep_a_peer_alive() {
        let mut d = daemon().await;
        let device = remote_device("peer-a", DeviceOs::Linux);
        let beacon = |d: &mut TestDaemon| {
            d.mgr.handle_event(ManagerEvent::Beacon {
                addr: IpAddr::from([192, 168, 1, 20]),
                tcp_port: 4050,
                device: device.clone(),
            })
        };

        beacon(&mut d);
        tokio::time::advance(Duration::from_secs(20)).await;
        d.mgr.sweep_timers();
        assert_eq!(d.mgr.peer_count(), 1);

        // A fresh beacon resets the offline window.
        beacon(&mut d);
        tokio::time::advance(Duration::from_secs(20)).await;
        d.mgr.sweep_timers();
        assert_eq!(d.mgr.peer_count(), 1, "beacon must reset the window");

        tokio::time::advance(Duration::from_secs(6)).await;
        d.mgr.sweep_timers();
        assert_eq!(d.mgr.peer_count(), 0);
    }

    // -- Tie-break ---------------------------------------------------

    #[tokio::test]
    async fn dial_race_lower_uuid_keeps_its_dial() {
        // Local "aaaa" < remote "zzzz": the inbound request is refused.
        let mut d = daemon_with_uuid("aaaa").await;
        let id = PeerUuid::new("zzzz");

        let (_listener, port) = parked_listener().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([127, 0, 0, 1]),
            tcp_port: port,
            device: remote_device("zzzz", DeviceOs::Linux),
        });
        d.mgr
            .handle_event(ManagerEvent::Command(Command::Connect { uuid: id.clone() }));
        assert_eq!(d.mgr.peer(&id).unwrap().state(), SessionState::Connecting);

        let mut peer = inbound(&mut d);
        peer.send(&PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: remote_device("zzzz", DeviceOs::Linux),
        })
        .await;

        match recv_pumped(&mut d, &mut peer).await {
            Some(PeerMessage::PairResponse { agree, .. }) => assert!(!agree),
            other => panic!("expected refusal, got {other:?}"),
        }
        assert!(
            matches!(
                d.mgr.peer(&id).unwrap().state(),
                SessionState::Connecting | SessionState::AwaitingPair
            ),
            "our own outbound attempt stays in flight"
        );
    }

    #[tokio::test]
    async fn dial_race_higher_uuid_serves_the_inbound() {
        // Local "zzzz" > remote "aaaa": our dial is abandoned and the
        // inbound request goes to the user.
        let mut d = daemon_with_uuid("zzzz").await;
        let id = PeerUuid::new("aaaa");

        let (_listener, port) = parked_listener().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([127, 0, 0, 1]),
            tcp_port: port,
            device: remote_device("aaaa", DeviceOs::Linux),
        });
        d.mgr
            .handle_event(ManagerEvent::Command(Command::Connect { uuid: id.clone() }));

        let mut peer = inbound(&mut d);
        peer.send(&PeerMessage::PairRequest {
            key: SCAN_KEY.to_string(),
            device: remote_device("aaaa", DeviceOs::Linux),
        })
        .await;

        pump_until(&mut d, "serving the inbound request", |m| {
            m.peer(&id)
                .is_some_and(|p| p.state() == SessionState::AwaitingUserConfirm)
        })
        .await;
    }

    // -- Registry ----------------------------------------------------

    #[tokio::test]
    async fn beacon_creates_then_refreshes_a_machine() {
        let mut d = daemon().await;
        let id = PeerUuid::new("peer-a");

        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([192, 168, 1, 20]),
            tcp_port: 4050,
            device: remote_device("peer-a", DeviceOs::Linux),
        });
        let machine = d.mgr.peer(&id).unwrap();
        assert_eq!(machine.ip(), IpAddr::from([192, 168, 1, 20]));
        assert_eq!(machine.name(), "Peer-peer-a");

        // The peer moved; the next beacon refreshes the address.
        let mut moved = remote_device("peer-a", DeviceOs::Linux);
        moved.name = "Renamed".to_string();
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([192, 168, 1, 99]),
            tcp_port: 4051,
            device: moved,
        });
        assert_eq!(d.mgr.peer_count(), 1);
        let machine = d.mgr.peer(&id).unwrap();
        assert_eq!(machine.ip(), IpAddr::from([192, 168, 1, 99]));
        assert_eq!(machine.name(), "Renamed");
    }

    #[tokio::test]
    async fn own_beacon_is_ignored() {
        let mut d = daemon().await;
        d.mgr.handle_event(ManagerEvent::Beacon {
            addr: IpAddr::from([127, 0, 0, 1]),
            tcp_port: 4050,
            device: remote_device("local-uuid", DeviceOs::Linux),
        });
        assert_eq!(d.mgr.peer_count(), 0);
    }
}
