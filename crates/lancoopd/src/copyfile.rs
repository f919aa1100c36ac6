//! File-copy child process.
//!
//! An accepted `FsSendFileRequest` pulls the file out of the FUSE mount
//! with a plain `/bin/cp` child — the mount makes the remote file look
//! local, so copying it is exactly reading it through the filesystem.
//! The session must not wait on the copy, so the child runs detached and
//! its exit status re-enters the manager loop as an event.
//!
//! A machine that tears down mid-copy simply never sees the completion
//! event; the child itself is left to finish or fail on its own.

use crate::manager::{ManagerEvent, ManagerHandle};
use lancoop_core::types::PeerUuid;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Path of the copy helper.
const CP_BIN: &str = "/bin/cp";

/// Spawns `/bin/cp <src> <dst_dir>` and reports the outcome.
///
/// `wire_path` is the path as named in the request; it is echoed back in
/// the completion event so the session can build the `FsSendFileResult`.
pub fn spawn_copy(
    src: PathBuf,
    dst_dir: PathBuf,
    uuid: PeerUuid,
    serial: u32,
    wire_path: String,
    events: ManagerHandle,
) {
    tokio::spawn(async move {
        if let Err(e) = tokio::fs::create_dir_all(&dst_dir).await {
            warn!(dir = %dst_dir.display(), error = %e, "cannot create receive directory");
            let _ = events
                .send(ManagerEvent::CopyFinished {
                    uuid,
                    serial,
                    path: wire_path,
                    success: false,
                })
                .await;
            return;
        }

        let status = Command::new(CP_BIN).arg(&src).arg(&dst_dir).status().await;

        let success = match status {
            Ok(status) => {
                debug!(src = %src.display(), %status, "copy finished");
                status.success()
            }
            Err(e) => {
                warn!(src = %src.display(), error = %e, "failed to run copy helper");
                false
            }
        };

        let _ = events
            .send(ManagerEvent::CopyFinished {
                uuid,
                serial,
                path: wire_path,
                success,
            })
            .await;
    });
}
