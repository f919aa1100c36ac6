//! Domain types for lancoop.
//!
//! Core identity and capability types are defined here as **newtypes** and
//! small enums — thin wrappers that give values distinct identities in the
//! type system. This prevents accidentally passing a peer uuid where a
//! device name is expected, which would compile fine if both were plain
//! `String`s.
//!
//! All of these types cross the wire inside `PairRequest`/`PairResponse`
//! and the discovery beacon, so they derive `Serialize`/`Deserialize`
//! (MessagePack via `rmp-serde`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Shared constants
// ---------------------------------------------------------------------------

/// Literal scan key carried by discovery beacons and pair handshakes.
/// Daemons of the same product family recognize each other by it; a
/// mismatch is grounds for rejecting the pair.
pub const SCAN_KEY: &str = "UOS-COOPERATION";

/// Well-known UDP port for discovery beacons.
pub const DEFAULT_DISCOVERY_PORT: u16 = 51595;

/// How often a machine pings a known-but-unconnected peer.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

/// How long a peer may stay silent before its machine is removed.
pub const OFFLINE_WINDOW: Duration = Duration::from_secs(25);

/// TCP keepalive idle time on paired connections. Once paired, liveness
/// detection moves from beacon timers to the transport.
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(20);

/// Byte written by the confirm dialog when the user accepts a pair request.
pub const CONFIRM_ACCEPT: u8 = 1;

/// Byte written by the confirm dialog when the user rejects a pair request.
pub const CONFIRM_REJECT: u8 = 0;

// ---------------------------------------------------------------------------
// PeerUuid — stable identity of a machine running lancoop
// ---------------------------------------------------------------------------

/// A unique identifier for a peer on the network.
///
/// Generated once on first run (UUID v4) and persisted in the local config.
/// Two different machines will always have different `PeerUuid`s, even if
/// they carry the same display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerUuid(String);

impl PeerUuid {
    /// Creates a `PeerUuid` from a string.
    ///
    /// In production this will be a UUID, but we accept any string
    /// to keep tests simple.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random `PeerUuid` using UUID v4.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DeviceOs / Compositor — platform facts exchanged during pairing
// ---------------------------------------------------------------------------

/// Operating system family of a peer.
///
/// Clipboard target synthesis differs between UOS and the rest (see the
/// session handlers), so peers tell each other which family they are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceOs {
    Uos,
    Linux,
    Windows,
    Macos,
    Android,
    Other,
}

impl DeviceOs {
    /// The OS family this daemon was built for.
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            DeviceOs::Linux
        } else if cfg!(target_os = "windows") {
            DeviceOs::Windows
        } else if cfg!(target_os = "macos") {
            DeviceOs::Macos
        } else if cfg!(target_os = "android") {
            DeviceOs::Android
        } else {
            DeviceOs::Other
        }
    }
}

/// Display compositor the peer runs under. Input injection needs to know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compositor {
    X11,
    Wayland,
    None,
}

impl Compositor {
    /// Best-effort detection from the session environment.
    pub fn detect() -> Self {
        match std::env::var("XDG_SESSION_TYPE").as_deref() {
            Ok("wayland") => Compositor::Wayland,
            Ok("x11") => Compositor::X11,
            _ if std::env::var_os("WAYLAND_DISPLAY").is_some() => Compositor::Wayland,
            _ if std::env::var_os("DISPLAY").is_some() => Compositor::X11,
            _ => Compositor::None,
        }
    }
}

// ---------------------------------------------------------------------------
// DeviceInfo — the immutable identity record sent in pair handshakes
// ---------------------------------------------------------------------------

/// Complete identity of a device, transmitted in pair requests/responses
/// and discovery beacons. Immutable for the lifetime of a daemon run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable peer identity (UUID v4, generated on first run).
    pub uuid: PeerUuid,
    /// Human-readable name chosen by the peer's user.
    pub name: String,
    /// Operating system family.
    pub os: DeviceOs,
    /// Display compositor.
    pub compositor: Compositor,
}

// ---------------------------------------------------------------------------
// InputDeviceType — which emittor an input event is destined for
// ---------------------------------------------------------------------------

/// The class of input device an `InputEventRequest` targets.
///
/// Each paired machine keeps one injector wrapper per device type; an
/// event for a type with no injector is answered `success = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputDeviceType {
    Keyboard,
    Mouse,
    Touchpad,
}

// ---------------------------------------------------------------------------
// FlowDirection — which screen edge carries the cursor across
// ---------------------------------------------------------------------------

/// Screen edge through which the shared cursor leaves one device and
/// enters the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    Top,
    Bottom,
    Left,
    Right,
}

impl FlowDirection {
    /// The edge seen from the other device: a cursor leaving our RIGHT
    /// edge enters the peer through its LEFT edge, and so on.
    pub fn opposite(self) -> Self {
        match self {
            FlowDirection::Top => FlowDirection::Bottom,
            FlowDirection::Bottom => FlowDirection::Top,
            FlowDirection::Left => FlowDirection::Right,
            FlowDirection::Right => FlowDirection::Left,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
