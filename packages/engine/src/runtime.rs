// ABOUTME: Sandbox runtime adapter contract consumed by the supervisor
// ABOUTME: Defines the mount/spawn/teardown seam and the guest event stream

use crate::bundle::SourceBundle;
use crate::types::{EngineResult, ResourceLimits};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Which guest stream a line of output arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Event observed from a supervised guest process.
///
/// Output lines, the server-ready signal, and exit are merged into a single
/// stream so the supervisor can serialize them through one select loop.
#[derive(Debug, Clone)]
pub enum GuestEvent {
    Output { stream: StreamKind, line: String },
    /// The guest began listening on a port; `url` is reachable only within
    /// the sandbox boundary.
    ServerReady { url: String },
    /// Final event for a process. `code` follows the 128+signal convention
    /// when the guest died to a signal.
    Exited { code: Option<i32> },
}

/// Handle to a mounted bundle. Exactly one per session, never shared.
#[derive(Debug, Clone)]
pub struct MountHandle {
    pub id: Uuid,
    /// Filesystem root for runtimes that mount onto the host; `None` for
    /// purely virtual runtimes.
    pub root: Option<PathBuf>,
}

impl MountHandle {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            root,
        }
    }
}

/// A spawned guest process: its merged event stream plus a kill switch.
///
/// The session's supervisor owns this exclusively; no other component may
/// drive or terminate the process.
pub struct GuestProcess {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<GuestEvent>,
    kill_tx: mpsc::Sender<()>,
}

impl GuestProcess {
    pub fn new(
        pid: Option<u32>,
        events: mpsc::UnboundedReceiver<GuestEvent>,
        kill_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            pid,
            events,
            kill_tx,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next guest event, or `None` once the runtime has dropped its side
    /// after exit.
    pub async fn next_event(&mut self) -> Option<GuestEvent> {
        self.events.recv().await
    }

    /// Request termination. Idempotent: repeated kills and kills after exit
    /// are no-ops.
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// Isolated execution environment with its own filesystem and process
/// space and no network egress.
///
/// Contract: guest writes stay confined under the mounted root; one mount
/// per session; `teardown` releases everything the mount acquired and is
/// safe to call more than once.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Materialize the bundle inside the sandbox.
    async fn mount(&self, bundle: &SourceBundle) -> EngineResult<MountHandle>;

    /// Spawn a command inside a mounted sandbox with the session's resource
    /// limits applied.
    async fn spawn(
        &self,
        handle: &MountHandle,
        command: &str,
        args: &[String],
        limits: &ResourceLimits,
    ) -> EngineResult<GuestProcess>;

    /// Release the sandbox: kill anything still alive under it and drop its
    /// filesystem.
    async fn teardown(&self, handle: &MountHandle) -> EngineResult<()>;
}
