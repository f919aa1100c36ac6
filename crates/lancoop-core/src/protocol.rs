//! Peer-to-peer wire protocol for lancoop.
//!
//! This module defines the messages exchanged between lancoop daemons over
//! TCP connections on the local network, and the framed codec that carries
//! them.
//!
//! # Wire Format
//!
//! Each message is transmitted as a **magic-and-length-prefixed frame**:
//!
//! ```text
//! +--------------------+---------------------+------------------------------+
//! | Magic (8 bytes)    | Length (8 bytes)    | MessagePack payload          |
//! | 'D','D','E','C',   | big-endian u64      | (variable length)            |
//! | 'P','R','T',0      |                     |                              |
//! +--------------------+---------------------+------------------------------+
//! ```
//!
//! The magic lets a receiver detect a desynchronized or foreign stream
//! immediately instead of trusting an arbitrary length field; the length
//! tells it how many payload bytes to wait for. Peers must share the same
//! message schema — there is no negotiation.
//!
//! # Why MessagePack?
//!
//! - **Compact**: significantly smaller than JSON (no textual framing)
//! - **Self-describing**: `to_vec_named` keeps field names as tags, so a
//!   record can grow fields without breaking older decoders
//! - **Fast**: near-zero overhead for encoding/decoding
//!
//! # Decoding discipline
//!
//! [`decode`] peeks before it consumes: an incomplete frame leaves the
//! buffer untouched and reports [`Decoded::Partial`] so the reader can
//! accumulate more bytes. A magic mismatch, an absurd length, or a payload
//! that does not deserialize is [`Decoded::Illegal`] — terminal for the
//! connection.

use crate::buffer::RecvBuffer;
use crate::types::{DeviceInfo, FlowDirection, InputDeviceType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame magic: ASCII "DDECPRT" plus a trailing NUL.
pub const FRAME_MAGIC: [u8; 8] = *b"DDECPRT\0";

/// Fixed frame header size: 8-byte magic + 8-byte length.
pub const HEADER_LEN: usize = 16;

/// Maximum payload size: 1 MB. Any frame larger than this is treated as
/// illegal to prevent memory exhaustion from malformed data.
pub const MAX_FRAME_SIZE: u64 = 1_048_576;

/// Errors that can occur when encoding a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// A message exchanged between two lancoop daemons over TCP.
///
/// Each variant represents one sub-protocol interaction. The
/// `#[serde(tag = "type")]` attribute adds a `"type"` field to the
/// serialized form, making the union self-identifying on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Opens the pairing handshake. Carries the sender's identity and the
    /// scan key; a key mismatch is grounds for rejection.
    PairRequest { key: String, device: DeviceInfo },

    /// Answers a `PairRequest` after the remote user decided.
    PairResponse {
        key: String,
        device: DeviceInfo,
        agree: bool,
    },

    /// Tells the peer which local services are switched on. Sent on
    /// entering the paired state and whenever a toggle changes.
    ServiceOnOff {
        shared_clipboard_on: bool,
        shared_devices_on: bool,
    },

    /// Asks the peer to become the sink of a device-sharing session.
    DeviceSharingStartRequest,

    /// Answers a `DeviceSharingStartRequest`.
    DeviceSharingStartResponse { accept: bool },

    /// Ends the active device-sharing session.
    DeviceSharingStopRequest,

    /// Present in the schema for symmetry; no handler ever sends it.
    DeviceSharingStopResponse,

    /// One input event to inject on the receiving device.
    InputEventRequest {
        serial: u32,
        device_type: InputDeviceType,
        event_type: u32,
        code: u32,
        value: i32,
    },

    /// Reports whether the event in `InputEventRequest { serial }` reached
    /// an injector.
    InputEventResponse { serial: u32, success: bool },

    /// Announces which screen edge the sender assigned to this link.
    FlowDirectionNtf { direction: FlowDirection },

    /// The shared cursor crossed a screen edge at (x, y).
    FlowRequest {
        direction: FlowDirection,
        x: i32,
        y: i32,
    },

    /// Answers a `FlowRequest`.
    FlowResponse { agree: bool },

    /// Asks the peer to expose its filesystem for mounting.
    FsRequest { serial: u32 },

    /// Answers `FsRequest`: when accepted, `port` is the ephemeral port the
    /// serve endpoint listens on.
    FsResponse {
        serial: u32,
        accepted: bool,
        port: u16,
    },

    /// Asks the peer to pull `path` out of the mounted filesystem into its
    /// local receive directory.
    FsSendFileRequest { serial: u32, path: String },

    /// Immediate answer to `FsSendFileRequest`; `accepted = false` means no
    /// mount is active and no result will follow.
    FsSendFileResponse { serial: u32, accepted: bool },

    /// Final outcome of an accepted file transfer.
    FsSendFileResult {
        serial: u32,
        path: String,
        result: bool,
    },

    /// The sender's clipboard changed; `targets` lists the offered
    /// MIME-like selection targets.
    ClipboardNotify { targets: Vec<String> },

    /// Asks the clipboard owner for the content of one target.
    ClipboardGetContentRequest { target: String },

    /// Content of one clipboard target, fetched from the owner.
    ClipboardGetContentResponse { target: String, content: String },
}

/// Outcome of one [`decode`] attempt against the receive buffer.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    /// A complete frame was consumed and parsed.
    Message(PeerMessage),
    /// Not enough bytes buffered yet; read more and retry. Nothing was
    /// consumed.
    Partial,
    /// The stream is not speaking this protocol (bad magic, absurd length,
    /// or undecodable payload). The caller must close the connection.
    Illegal,
}

/// Encodes a `PeerMessage` into a complete frame.
///
/// The returned buffer contains the 16-byte header (magic + big-endian
/// payload length) followed by the MessagePack payload. This is the exact
/// byte sequence handed to the connection's write queue.
pub fn encode(msg: &PeerMessage) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec_named(msg)?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&FRAME_MAGIC);
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Reads without consuming until a full frame is present, then consumes
/// exactly `header + length` bytes. Trailing bytes stay buffered for the
/// next call, so a drain loop can pull several messages out of one socket
/// read.
pub fn decode(buf: &mut RecvBuffer) -> Decoded {
    let Some(header) = buf.peek(HEADER_LEN) else {
        return Decoded::Partial;
    };

    if header[..8] != FRAME_MAGIC {
        return Decoded::Illegal;
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[8..16]);
    let length = u64::from_be_bytes(len_bytes);

    if length > MAX_FRAME_SIZE {
        return Decoded::Illegal;
    }

    let total = HEADER_LEN + length as usize;
    if buf.len() < total {
        return Decoded::Partial;
    }

    let msg: Result<PeerMessage, _> = rmp_serde::from_slice(&buf.data()[HEADER_LEN..total]);
    match msg {
        Ok(msg) => {
            buf.advance(total);
            Decoded::Message(msg)
        }
        // A well-framed but undecodable body means the peer runs a
        // different schema generation; the connection cannot recover.
        Err(_) => Decoded::Illegal,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
