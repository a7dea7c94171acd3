// ABOUTME: Local sandbox runtime backed by namespaced host processes
// ABOUTME: Mounts bundles into scratch dirs, spawns guests with rlimits, streams output

use crate::bundle::SourceBundle;
use crate::runtime::{GuestEvent, GuestProcess, MountHandle, SandboxRuntime, StreamKind};
use crate::types::{EngineError, EngineResult, ResourceLimits};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a guest gets between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(2);

struct MountEntry {
    dir: TempDir,
    kills: Vec<mpsc::Sender<()>>,
}

/// Sandbox runtime that runs guests as host processes confined to a
/// per-session scratch directory.
///
/// Isolation is applied in the child before exec: an unprivileged user
/// namespace followed by a fresh network namespace (no egress), plus an
/// address-space rlimit from the session's `ResourceLimits`. Hosts that
/// refuse unprivileged namespaces degrade to rlimit-only isolation; the
/// watchdog and classifier still bound runaway behavior above this layer.
pub struct ProcessRuntime {
    mounts: Arc<RwLock<HashMap<Uuid, MountEntry>>>,
    isolate: bool,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            isolate: true,
        }
    }

    /// Disable namespace isolation (tests and hosts without user
    /// namespaces).
    pub fn without_isolation() -> Self {
        Self {
            mounts: Arc::new(RwLock::new(HashMap::new())),
            isolate: false,
        }
    }
}

/// Extract a preview URL from a server startup line if one is announced.
fn detect_ready_url(line: &str) -> Option<String> {
    // Common startup banners across dev servers
    let patterns = [
        r"Local:\s+http://localhost:(\d+)",        // Vite
        r"Local server:\s+http://localhost:(\d+)", // Some frameworks
        r"Running at http://localhost:(\d+)",      // Express-style
        r"Server ready at http://localhost:(\d+)", // Next.js dev
        r"server running on port (\d+)",
        r"ready - started server on.*:(\d+)", // Next.js: "ready - started server on 0.0.0.0:3000"
        r"Listening on port (\d+)",
        r"http://localhost:(\d+)", // Generic fallback
    ];

    for pattern in &patterns {
        if let Ok(regex) = regex::Regex::new(pattern) {
            if let Some(captures) = regex.captures(line) {
                if let Some(port_match) = captures.get(1) {
                    if let Ok(port) = port_match.as_str().parse::<u16>() {
                        return Some(format!("http://localhost:{}", port));
                    }
                }
            }
        }
    }
    None
}

fn exit_code_of(status: std::io::Result<std::process::ExitStatus>) -> Option<i32> {
    let status = status.ok()?;
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

/// Pump one guest stream into the shared event channel, flagging the first
/// announced listen URL as server-ready.
fn pump_output<R>(
    reader: R,
    stream: StreamKind,
    events: mpsc::UnboundedSender<GuestEvent>,
    ready_sent: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(url) = detect_ready_url(&line) {
                if !ready_sent.swap(true, Ordering::SeqCst) {
                    let _ = events.send(GuestEvent::ServerReady { url });
                }
            }
            let _ = events.send(GuestEvent::Output { stream, line });
        }
    });
}

/// SIGTERM first, then SIGKILL once the grace period runs out.
async fn terminate(child: &mut Child) -> Option<i32> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(_) => debug!("Sent SIGTERM to guest process {}", pid),
            Err(e) => warn!("Failed to send SIGTERM to guest process {}: {}", pid, e),
        }

        if let Ok(status) = timeout(KILL_GRACE, child.wait()).await {
            debug!("Guest process {} terminated gracefully", pid);
            return exit_code_of(status);
        }
        warn!(
            "Guest process {} ignored SIGTERM, sending SIGKILL",
            pid
        );
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill guest process: {}", e);
    }
    exit_code_of(child.wait().await)
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    async fn mount(&self, bundle: &SourceBundle) -> EngineResult<MountHandle> {
        let dir = TempDir::with_prefix("sandlot-").map_err(|e| EngineError::MountFailed {
            reason: format!("Failed to create scratch directory: {}", e),
        })?;

        // Bundle paths were validated on construction, so joining is safe
        for (path, content) in bundle.iter() {
            let target = dir.path().join(path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, content).await?;
        }

        let handle = MountHandle::new(Some(dir.path().to_path_buf()));
        info!(
            "Mounted {} files at {} for sandbox {}",
            bundle.len(),
            dir.path().display(),
            handle.id
        );

        let mut mounts = self.mounts.write().await;
        mounts.insert(
            handle.id,
            MountEntry {
                dir,
                kills: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn spawn(
        &self,
        handle: &MountHandle,
        command: &str,
        args: &[String],
        limits: &ResourceLimits,
    ) -> EngineResult<GuestProcess> {
        let root = {
            let mounts = self.mounts.read().await;
            let entry = mounts
                .get(&handle.id)
                .ok_or(EngineError::MountNotFound { mount_id: handle.id })?;
            entry.dir.path().to_path_buf()
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(&root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let isolate = self.isolate;
            let mem_bytes = limits.memory_limit_bytes() as libc::rlim_t;
            // SAFETY: runs after fork in the child; only async-signal-safe
            // syscalls (unshare, setrlimit) are used.
            unsafe {
                cmd.pre_exec(move || {
                    if isolate {
                        // User namespace first so the network unshare is
                        // unprivileged. Best effort: degraded isolation is
                        // still bounded by rlimits and the watchdog.
                        if libc::unshare(libc::CLONE_NEWUSER) == 0 {
                            libc::unshare(libc::CLONE_NEWNET);
                        }
                    }
                    let limit = libc::rlimit {
                        rlim_cur: mem_bytes,
                        rlim_max: mem_bytes,
                    };
                    libc::setrlimit(libc::RLIMIT_AS, &limit);
                    libc::setrlimit(libc::RLIMIT_CORE, &libc::rlimit {
                        rlim_cur: 0,
                        rlim_max: 0,
                    });
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::SpawnFailed {
            command: format!("{} {}", command, args.join(" ")),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        info!(
            "Spawned guest '{} {}' with PID {:?} in sandbox {}",
            command,
            args.join(" "),
            pid,
            handle.id
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = mpsc::channel(1);
        let ready_sent = Arc::new(AtomicBool::new(false));

        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, StreamKind::Stdout, events_tx.clone(), ready_sent.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, StreamKind::Stderr, events_tx.clone(), ready_sent.clone());
        }

        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => exit_code_of(status),
                _ = kill_rx.recv() => terminate(&mut child).await,
            };
            debug!("Guest process {:?} exited with code {:?}", pid, code);
            let _ = events_tx.send(GuestEvent::Exited { code });
        });

        {
            let mut mounts = self.mounts.write().await;
            if let Some(entry) = mounts.get_mut(&handle.id) {
                entry.kills.push(kill_tx.clone());
            }
        }

        Ok(GuestProcess::new(pid, events_rx, kill_tx))
    }

    async fn teardown(&self, handle: &MountHandle) -> EngineResult<()> {
        let entry = {
            let mut mounts = self.mounts.write().await;
            mounts.remove(&handle.id)
        };

        match entry {
            Some(entry) => {
                for kill in &entry.kills {
                    let _ = kill.try_send(());
                }
                // TempDir drop removes the scratch directory
                info!("Tore down sandbox {}", handle.id);
            }
            None => {
                debug!("Teardown for sandbox {} already done", handle.id);
            }
        }
        Ok(())
    }
}
