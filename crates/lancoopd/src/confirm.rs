//! Pair-confirmation dialog wrapper.
//!
//! Pairing needs the local user's consent, and the daemon has no UI of
//! its own. It spawns an external dialog process with the requesting
//! peer's name as argument; the process writes exactly one status byte
//! (`1` accept, `0` reject) to stdout and exits. The wrapper reads that
//! byte and re-enters the session through the manager handle.
//!
//! The dialog can also vanish without answering (user closed the window,
//! helper missing). That counts as a rejection — pairing must never
//! complete without an explicit accept.

use crate::manager::{ManagerEvent, ManagerHandle};
use lancoop_core::types::{PeerUuid, CONFIRM_ACCEPT};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A running confirmation dialog bound to one inbound pair request.
///
/// Dropping the handle (machine teardown, second request superseding the
/// first) kills the dialog without reporting a decision.
#[derive(Debug)]
pub struct ConfirmDialog {
    cancel: CancellationToken,
}

impl ConfirmDialog {
    /// Spawns the dialog helper and the task that waits for its answer.
    ///
    /// `command` is the helper argv prefix from the config; the peer's
    /// display name is appended so the dialog can show who is asking.
    pub fn spawn(
        command: &str,
        peer_name: &str,
        uuid: PeerUuid,
        events: ManagerHandle,
    ) -> std::io::Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or(command);
        let mut child = Command::new(program)
            .args(parts)
            .arg(peer_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut byte = [0u8; 1];
            let decision = async {
                match stdout {
                    Some(mut out) => match out.read_exact(&mut byte).await {
                        Ok(_) => byte[0] == CONFIRM_ACCEPT,
                        Err(e) => {
                            debug!(error = %e, "confirm dialog closed without answering");
                            false
                        }
                    },
                    None => false,
                }
            };

            let accepted = tokio::select! {
                _ = token.cancelled() => {
                    // Dismissed by the session; no decision to deliver.
                    let _ = child.kill().await;
                    return;
                }
                accepted = decision => accepted,
            };

            // Reap the child; it exits right after writing its byte.
            let _ = child.wait().await;

            if events
                .send(ManagerEvent::ConfirmDecision { uuid, accepted })
                .await
                .is_err()
            {
                warn!("manager gone before confirm decision was delivered");
            }
        });

        Ok(Self { cancel })
    }

    /// Kills the dialog without a decision.
    pub fn dismiss(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConfirmDialog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
