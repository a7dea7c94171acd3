// ABOUTME: Single-writer state machine supervising one preview session
// ABOUTME: Serializes guest output, watchdog signals and cancellation into state transitions

use crate::buffer::OutputBuffer;
use crate::bundle::{EntryCommands, Manifest, SourceBundle};
use crate::classifier::classify;
use crate::runtime::{GuestEvent, GuestProcess, MountHandle, SandboxRuntime};
use crate::types::{FailureClass, ResourceLimits, SessionEvent, SessionState};
use crate::watchdog::{OutputScanner, StartupDeadline};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on runtime teardown so cancellation never blocks
/// indefinitely.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Final resolution of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Failed(FailureClass),
    Cancelled,
}

/// How a supervised phase ended.
enum PhaseEnd {
    InstallOk,
    Terminal(Outcome),
}

/// Drives one session from Mounting to a terminal state.
///
/// The supervisor task is the sole mutator of session state. Watchdog
/// expiry, guest output and cancellation all arrive as signals in its
/// select loop; whichever signal is processed first wins, and once a
/// terminal outcome is chosen every later signal is ignored. Every exit
/// path kills the live guest and releases the sandbox.
pub struct Supervisor {
    session_id: Uuid,
    app_id: String,
    bundle: SourceBundle,
    limits: ResourceLimits,
    runtime: Arc<dyn SandboxRuntime>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: mpsc::Receiver<()>,
    // Keeps the cancel channel open so a dropped manager handle does not
    // read as a cancellation
    _cancel_guard: mpsc::Sender<()>,
    buffer: OutputBuffer,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: Uuid,
        app_id: String,
        bundle: SourceBundle,
        limits: ResourceLimits,
        runtime: Arc<dyn SandboxRuntime>,
        events: mpsc::UnboundedSender<SessionEvent>,
        cancel: mpsc::Receiver<()>,
        cancel_guard: mpsc::Sender<()>,
    ) -> Self {
        let buffer = OutputBuffer::new(limits.output_buffer_bytes);
        Self {
            session_id,
            app_id,
            bundle,
            limits,
            runtime,
            events,
            cancel,
            _cancel_guard: cancel_guard,
            buffer,
        }
    }

    /// Run the session to completion. Consumes the supervisor; a session
    /// never transitions again after its terminal event.
    pub async fn run(mut self) {
        info!(
            session_id = %self.session_id,
            app_id = %self.app_id,
            "Preview session starting"
        );

        let mut mount: Option<MountHandle> = None;
        let mut guest: Option<GuestProcess> = None;
        let outcome = self.drive(&mut mount, &mut guest).await;

        // Guaranteed release on every exit path
        if let Some(proc) = guest.as_ref() {
            proc.kill();
        }
        if let Some(handle) = mount {
            match timeout(TEARDOWN_GRACE, self.runtime.teardown(&handle)).await {
                Ok(Err(e)) => warn!(session_id = %self.session_id, "Teardown failed: {}", e),
                Err(_) => warn!(session_id = %self.session_id, "Teardown timed out"),
                Ok(Ok(())) => {}
            }
        }

        let terminal = match outcome {
            Outcome::Done => SessionEvent::state(SessionState::Done),
            Outcome::Failed(class) => {
                debug!(
                    session_id = %self.session_id,
                    "Retained output tail at failure: {:?}",
                    self.buffer.tail()
                );
                SessionEvent::failed(class)
            }
            Outcome::Cancelled => SessionEvent::state(SessionState::Cancelled),
        };
        info!(
            session_id = %self.session_id,
            state = terminal.state.as_str(),
            "Preview session finished"
        );
        let _ = self.events.send(terminal);
    }

    fn emit_state(&self, state: SessionState) {
        let _ = self.events.send(SessionEvent::state(state));
    }

    async fn drive(
        &mut self,
        mount: &mut Option<MountHandle>,
        guest: &mut Option<GuestProcess>,
    ) -> Outcome {
        self.emit_state(SessionState::Mounting);

        let cancel = &mut self.cancel;
        let handle = tokio::select! {
            _ = cancel.recv() => return Outcome::Cancelled,
            result = self.runtime.mount(&self.bundle) => match result {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(session_id = %self.session_id, "Mount failed: {}", e);
                    return Outcome::Failed(FailureClass::LaunchFailure);
                }
            },
        };
        let handle = mount.insert(handle).clone();

        let manifest = match Manifest::from_bundle(&self.bundle) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(session_id = %self.session_id, "Manifest unreadable: {}", e);
                return Outcome::Failed(FailureClass::LaunchFailure);
            }
        };
        let commands = EntryCommands::resolve(&manifest);

        // One budget covers install plus start; no reset between phases
        self.emit_state(SessionState::Installing);
        let mut deadline = StartupDeadline::arm(self.limits.startup_budget());

        let (command, args) = &commands.install;
        let install = match self.runtime.spawn(&handle, command, args, &self.limits).await {
            Ok(proc) => proc,
            Err(e) => {
                warn!(session_id = %self.session_id, "Install spawn failed: {}", e);
                return Outcome::Failed(FailureClass::LaunchFailure);
            }
        };
        let proc = guest.insert(install);

        match supervise_install(proc, &mut deadline, &mut self.cancel, &mut self.buffer).await {
            PhaseEnd::InstallOk => {}
            PhaseEnd::Terminal(outcome) => return outcome,
        }

        self.emit_state(SessionState::Starting);
        let (command, args) = &commands.start;
        let start = match self.runtime.spawn(&handle, command, args, &self.limits).await {
            Ok(proc) => proc,
            Err(e) => {
                warn!(session_id = %self.session_id, "Start spawn failed: {}", e);
                return Outcome::Failed(FailureClass::LaunchFailure);
            }
        };
        let proc = guest.insert(start);

        supervise_start(
            proc,
            &mut deadline,
            &mut self.cancel,
            &mut self.buffer,
            &self.events,
        )
        .await
    }
}

/// Supervise the install process until it exits cleanly or the session
/// resolves.
async fn supervise_install(
    proc: &mut GuestProcess,
    deadline: &mut StartupDeadline,
    cancel: &mut mpsc::Receiver<()>,
    buffer: &mut OutputBuffer,
) -> PhaseEnd {
    loop {
        tokio::select! {
            _ = cancel.recv() => {
                proc.kill();
                return PhaseEnd::Terminal(Outcome::Cancelled);
            }
            _ = deadline.expired() => {
                proc.kill();
                return PhaseEnd::Terminal(Outcome::Failed(FailureClass::StartupTimeout));
            }
            event = proc.next_event() => match event {
                Some(GuestEvent::Output { line, .. }) => {
                    if let Some(sig) = OutputScanner::scan(&line) {
                        debug!("Memory signature '{}' during install", sig);
                        proc.kill();
                        return PhaseEnd::Terminal(Outcome::Failed(FailureClass::MemoryExceeded));
                    }
                    buffer.push_line(&line);
                }
                // A ready signal cannot come from the installer
                Some(GuestEvent::ServerReady { .. }) => {}
                Some(GuestEvent::Exited { code: Some(0) }) => return PhaseEnd::InstallOk,
                Some(GuestEvent::Exited { code }) => {
                    let class = match classify(code, false, &buffer.tail()) {
                        // Install failing is a launch failure unless memory
                        // or timeout signals say otherwise
                        FailureClass::RuntimeError | FailureClass::Unknown => {
                            FailureClass::LaunchFailure
                        }
                        other => other,
                    };
                    return PhaseEnd::Terminal(Outcome::Failed(class));
                }
                None => return PhaseEnd::Terminal(Outcome::Failed(FailureClass::Unknown)),
            },
        }
    }
}

/// Supervise the start process: wait for the server-ready signal, then keep
/// supervising the running guest until exit or cancellation.
async fn supervise_start(
    proc: &mut GuestProcess,
    deadline: &mut StartupDeadline,
    cancel: &mut mpsc::Receiver<()>,
    buffer: &mut OutputBuffer,
    events: &mpsc::UnboundedSender<SessionEvent>,
) -> Outcome {
    let mut running = false;
    loop {
        tokio::select! {
            _ = cancel.recv() => {
                proc.kill();
                return Outcome::Cancelled;
            }
            _ = deadline.expired() => {
                proc.kill();
                return Outcome::Failed(FailureClass::StartupTimeout);
            }
            event = proc.next_event() => match event {
                Some(GuestEvent::ServerReady { url }) => {
                    if !running {
                        running = true;
                        // From here on the startup timer can no longer
                        // cause a transition
                        deadline.disarm();
                        info!("Guest server ready at {}", url);
                        let _ = events.send(SessionEvent::running(url));
                    }
                }
                Some(GuestEvent::Output { line, .. }) => {
                    if let Some(sig) = OutputScanner::scan(&line) {
                        debug!("Memory signature '{}' in guest output", sig);
                        proc.kill();
                        return Outcome::Failed(FailureClass::MemoryExceeded);
                    }
                    buffer.push_line(&line);
                }
                Some(GuestEvent::Exited { code }) => {
                    return match classify(code, running, &buffer.tail()) {
                        FailureClass::Ok => Outcome::Done,
                        class => Outcome::Failed(class),
                    };
                }
                None => return Outcome::Failed(FailureClass::Unknown),
            },
        }
    }
}
