//! Clipboard collaborator bridge.
//!
//! The desktop selection store lives outside the daemon (behind the
//! desktop bus); the session core talks to it through this seam. The
//! bridge runs a small task owning the target → content map and exposes
//! a callback-returning API:
//!
//! - `read` fetches one target's content and re-enters the session via
//!   the manager handle — the session handler that asked never blocks;
//! - `store` writes content received from a peer into the local store;
//! - `set_local` is the local-copy entry point: it updates the store and
//!   tells the manager so it can publish `ClipboardNotify` to all peers.
//!
//! All bridge calls are fire-and-forget `try_send`s so they are safe
//! from inside the manager loop.

use crate::manager::{ManagerEvent, ManagerHandle};
use lancoop_core::types::PeerUuid;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Depth of the bridge's job queue.
const JOB_QUEUE_DEPTH: usize = 64;

enum ClipboardJob {
    /// Fetch one target for a peer's `ClipboardGetContentRequest`.
    Read { target: String, requester: PeerUuid },
    /// Write entries received from the remote clipboard owner.
    Store { entries: Vec<(String, String)> },
    /// The local user copied something.
    SetLocal { entries: Vec<(String, String)> },
    /// Inspect one target (tests, debug surfaces).
    Get {
        target: String,
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Handle to the clipboard bridge task.
#[derive(Clone)]
pub struct ClipboardHandle {
    tx: mpsc::Sender<ClipboardJob>,
}

impl ClipboardHandle {
    /// Starts the bridge task. `events` is where read results and local
    /// change notifications are delivered.
    pub fn start(events: ManagerHandle) -> Self {
        let (tx, mut rx) = mpsc::channel::<ClipboardJob>(JOB_QUEUE_DEPTH);

        tokio::spawn(async move {
            let mut store: HashMap<String, String> = HashMap::new();
            while let Some(job) = rx.recv().await {
                match job {
                    ClipboardJob::Read { target, requester } => {
                        let content = store.get(&target).cloned().unwrap_or_default();
                        let event = ManagerEvent::ClipboardContent {
                            uuid: requester,
                            target,
                            content,
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    ClipboardJob::Store { entries } => {
                        for (target, content) in entries {
                            store.insert(target, content);
                        }
                    }
                    ClipboardJob::SetLocal { entries } => {
                        let targets: Vec<String> =
                            entries.iter().map(|(t, _)| t.clone()).collect();
                        for (target, content) in entries {
                            store.insert(target, content);
                        }
                        let event = ManagerEvent::ClipboardChanged { targets };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    ClipboardJob::Get { target, reply } => {
                        let _ = reply.send(store.get(&target).cloned());
                    }
                }
            }
            debug!("clipboard bridge stopped");
        });

        Self { tx }
    }

    /// Asynchronously fetches `target` for a peer; the content comes back
    /// as a `ClipboardContent` event.
    pub fn read(&self, target: String, requester: PeerUuid) {
        self.dispatch(ClipboardJob::Read { target, requester });
    }

    /// Writes remote content into the local store.
    pub fn store(&self, entries: Vec<(String, String)>) {
        self.dispatch(ClipboardJob::Store { entries });
    }

    /// Local-copy entry point: store and notify the manager. Called by
    /// the desktop-bus watcher collaborator.
    #[allow(dead_code)]
    pub fn set_local(&self, entries: Vec<(String, String)>) {
        self.dispatch(ClipboardJob::SetLocal { entries });
    }

    /// Reads one target back out of the store.
    #[allow(dead_code)]
    pub async fn get(&self, target: &str) -> Option<String> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(ClipboardJob::Get {
            target: target.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    fn dispatch(&self, job: ClipboardJob) {
        if self.tx.try_send(job).is_err() {
            warn!("clipboard bridge queue full, job dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
