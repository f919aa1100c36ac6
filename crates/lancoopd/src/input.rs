//! Input injector wrapper.
//!
//! Forwarded input events are injected by an external helper process —
//! the daemon never touches uinput or the compositor itself. One helper
//! runs per device type; it reads fixed 12-byte triples
//! `(u32 type, u32 code, i32 value)` from stdin and replays them on the
//! corresponding virtual device.
//!
//! `emit` is called from the manager loop and must not block, so the
//! wrapper puts a small queue between the session and the pipe: a writer
//! task drains the queue into the child's stdin. The boolean returned by
//! `emit` reports whether the queue accepted the triple.

use lancoop_core::types::InputDeviceType;
use std::process::Stdio;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One encoded input triple on its way to the injector pipe.
type Triple = [u8; 12];

/// Depth of the per-emittor queue. Input events are small and frequent;
/// a burst beyond this is dropped rather than stalling the session.
const EMIT_QUEUE_DEPTH: usize = 256;

/// Handle to a running injector helper for one device type.
#[derive(Debug)]
pub struct InputEmittor {
    tx: mpsc::Sender<Triple>,
    cancel: CancellationToken,
}

impl InputEmittor {
    /// Spawns the injector helper for `device_type`.
    ///
    /// `command` is the helper argv prefix from the config; the device
    /// type name is appended so one binary can serve all three types.
    pub fn spawn(command: &str, device_type: InputDeviceType) -> std::io::Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or(command);
        let type_arg = match device_type {
            InputDeviceType::Keyboard => "keyboard",
            InputDeviceType::Mouse => "mouse",
            InputDeviceType::Touchpad => "touchpad",
        };
        let mut child = Command::new(program)
            .args(parts)
            .arg(type_arg)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("injector child has no stdin"))?;

        let emittor = Self::from_writer(stdin);

        // Reap the child when it exits; the write task notices the broken
        // pipe independently.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(%status, "injector exited"),
                Err(e) => debug!(error = %e, "failed to wait on injector"),
            }
        });

        Ok(emittor)
    }

    /// Builds an emittor over an arbitrary writer.
    ///
    /// Production code goes through [`InputEmittor::spawn`]; tests hand in
    /// one end of an in-memory duplex and assert on the bytes.
    pub fn from_writer<W>(mut writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Triple>(EMIT_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let triple = tokio::select! {
                    _ = token.cancelled() => break,
                    t = rx.recv() => match t {
                        Some(t) => t,
                        None => break,
                    },
                };
                if let Err(e) = writer.write_all(&triple).await {
                    warn!(error = %e, "injector pipe broken");
                    token.cancel();
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        Self { tx, cancel }
    }

    /// Queues one `(type, code, value)` triple for injection.
    ///
    /// Returns whether the pipe accepted the bytes. The triple is written
    /// in native byte order — the injector is a child on the same host.
    pub fn emit(&self, event_type: u32, code: u32, value: i32) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let mut triple = [0u8; 12];
        triple[0..4].copy_from_slice(&event_type.to_ne_bytes());
        triple[4..8].copy_from_slice(&code.to_ne_bytes());
        triple[8..12].copy_from_slice(&value.to_ne_bytes());
        self.tx.try_send(triple).is_ok()
    }
}

impl Drop for InputEmittor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
