use crate::bundle::SourceBundle;
use crate::runtime::SandboxRuntime;
use crate::supervisor::Supervisor;
use crate::types::{EngineError, EngineResult, ResourceLimits, SessionEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Caller-supplied gate consulted before any sandbox resources are
/// allocated. Collaborators use this for quota/credit checks.
#[async_trait]
pub trait PreflightGate: Send + Sync {
    async fn allow_preview(&self, app_id: &str) -> bool;
}

/// A started preview session: its id and the event stream the caller
/// consumes. The stream ends with exactly one terminal event.
pub struct PreviewSession {
    pub id: Uuid,
    pub app_id: String,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

struct SessionHandle {
    id: Uuid,
    cancel: mpsc::Sender<()>,
}

/// Validate app ids used as session keys. Same character policy the ids
/// carry upstream: alphanumeric plus hyphen and underscore, nothing that
/// could smuggle a path.
fn validate_app_id(app_id: &str) -> EngineResult<()> {
    if app_id.is_empty() {
        return Err(EngineError::InvalidAppId {
            app_id: app_id.to_string(),
            reason: "App ID cannot be empty".to_string(),
        });
    }

    if !app_id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::InvalidAppId {
            app_id: app_id.to_string(),
            reason: "App ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Owns at most one active session per app and guarantees teardown on
/// completion, failure or cancellation.
pub struct SessionManager {
    runtime: Arc<dyn SandboxRuntime>,
    limits: ResourceLimits,
    gate: Option<Arc<dyn PreflightGate>>,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionManager {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, limits: ResourceLimits) -> Self {
        Self {
            runtime,
            limits,
            gate: None,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Install a pre-flight gate consulted on every `start_preview`.
    pub fn with_gate(mut self, gate: Arc<dyn PreflightGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Start a preview session for an app bundle.
    ///
    /// Any session already active for this app is cancelled first; sessions
    /// are never reused. If the pre-flight gate denies the request, no
    /// session is created and no sandbox resources are allocated.
    pub async fn start_preview(
        &self,
        app_id: &str,
        bundle: SourceBundle,
    ) -> EngineResult<PreviewSession> {
        validate_app_id(app_id)?;

        if let Some(gate) = &self.gate {
            if !gate.allow_preview(app_id).await {
                info!(app_id, "Preview denied by pre-flight gate");
                return Err(EngineError::PreflightDenied);
            }
        }

        let session_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::channel(2);

        let supervisor = Supervisor::new(
            session_id,
            app_id.to_string(),
            bundle,
            self.limits.clone(),
            self.runtime.clone(),
            events_tx,
            cancel_rx,
            cancel_tx.clone(),
        );

        // One active session per app: supersede, never reuse. Removing the
        // old handle and registering the new one happen under a single
        // write guard so concurrent starts for the same app cannot both
        // stay registered, leaving one session running but uncancellable.
        let task = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.remove(app_id) {
                info!(
                    app_id,
                    session_id = %existing.id,
                    "Cancelling superseded preview session"
                );
                let _ = existing.cancel.try_send(());
            }
            sessions.insert(
                app_id.to_string(),
                SessionHandle {
                    id: session_id,
                    cancel: cancel_tx,
                },
            );
            tokio::spawn(supervisor.run())
        };

        // Drop the registry entry once the supervisor finishes so finished
        // sessions do not linger as cancellable
        let sessions = self.sessions.clone();
        let key = app_id.to_string();
        tokio::spawn(async move {
            let _ = task.await;
            let mut sessions = sessions.write().await;
            if sessions.get(&key).map(|h| h.id) == Some(session_id) {
                sessions.remove(&key);
            }
        });

        info!(app_id, session_id = %session_id, "Preview session created");
        Ok(PreviewSession {
            id: session_id,
            app_id: app_id.to_string(),
            events: events_rx,
        })
    }

    /// Cancel the active session for an app, if any.
    ///
    /// Idempotent: unknown apps and already-finished sessions are no-ops.
    /// The supervisor performs the actual kill and sandbox release.
    pub async fn cancel_preview(&self, app_id: &str) {
        let handle = self.sessions.write().await.remove(app_id);
        match handle {
            Some(handle) => {
                info!(app_id, session_id = %handle.id, "Cancelling preview session");
                let _ = handle.cancel.try_send(());
            }
            None => debug!(app_id, "No active session to cancel"),
        }
    }

    /// Ids of sessions that have not reached a terminal state yet.
    pub async fn active_sessions(&self) -> Vec<(String, Uuid)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(app_id, handle)| (app_id.clone(), handle.id))
            .collect()
    }
}
