use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a preview session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Mounting,
    Installing,
    Starting,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Mounting => "mounting",
            SessionState::Installing => "installing",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Done => "done",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        }
    }

    /// Terminal states admit no further transitions; a new preview
    /// always creates a new session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed | SessionState::Cancelled
        )
    }
}

/// Classification of how a supervised guest process ended.
///
/// Each class carries a fixed, user-safe message. Raw guest output is kept
/// only in the session's output buffer for diagnostics and is never shown
/// to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Ok,
    StartupTimeout,
    MemoryExceeded,
    RuntimeError,
    LaunchFailure,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Ok => "ok",
            FailureClass::StartupTimeout => "startup_timeout",
            FailureClass::MemoryExceeded => "memory_exceeded",
            FailureClass::RuntimeError => "runtime_error",
            FailureClass::LaunchFailure => "launch_failure",
            FailureClass::Unknown => "unknown",
        }
    }

    /// Fixed explanatory message shown to the end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureClass::Ok => "The app is running.",
            FailureClass::StartupTimeout => {
                "The app took too long to start. It may contain an infinite loop."
            }
            FailureClass::MemoryExceeded => {
                "The app exceeded the sandbox memory limit and was stopped."
            }
            FailureClass::RuntimeError => "An error occurred while the app was running.",
            FailureClass::LaunchFailure => {
                "The app failed to start. There may be a problem with its code."
            }
            FailureClass::Unknown => "An unexpected error occurred while running the app.",
        }
    }
}

/// Resource limits applied to a session, supplied at creation and immutable
/// for the session's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock startup budget covering install plus start, in seconds.
    /// The budget is armed when Installing begins and is not reset between
    /// phases.
    pub startup_budget_secs: u64,
    /// Memory ceiling for the guest process in megabytes
    pub memory_limit_mb: u64,
    /// Cap on retained guest output, in bytes (most recent kept)
    pub output_buffer_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            startup_budget_secs: 10,
            memory_limit_mb: 128,
            output_buffer_bytes: 64 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn startup_budget(&self) -> Duration {
        Duration::from_secs(self.startup_budget_secs)
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }
}

/// State-change event surfaced to the caller.
///
/// A session emits a sequence of these on its event channel, terminating in
/// exactly one event whose state is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub state: SessionState,
    pub url: Option<String>,
    pub classification: Option<FailureClass>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SessionEvent {
    pub fn state(state: SessionState) -> Self {
        Self {
            state,
            url: None,
            classification: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn running(url: String) -> Self {
        Self {
            url: Some(url),
            ..Self::state(SessionState::Running)
        }
    }

    pub fn failed(classification: FailureClass) -> Self {
        Self {
            classification: Some(classification),
            message: Some(classification.user_message().to_string()),
            ..Self::state(SessionState::Failed)
        }
    }
}

/// Error types for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid app id '{app_id}': {reason}")]
    InvalidAppId { app_id: String, reason: String },

    #[error("Preview denied by pre-flight gate")]
    PreflightDenied,

    #[error("Invalid bundle path '{path}': {reason}")]
    InvalidBundlePath { path: String, reason: String },

    #[error("Bundle manifest unreadable: {reason}")]
    ManifestUnreadable { reason: String },

    #[error("Failed to mount bundle: {reason}")]
    MountFailed { reason: String },

    #[error("Sandbox mount not found: {mount_id}")]
    MountNotFound { mount_id: uuid::Uuid },

    #[error("Failed to spawn process '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Installing.is_terminal());
    }

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.startup_budget(), Duration::from_secs(10));
        assert_eq!(limits.memory_limit_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_failed_event_carries_fixed_message() {
        let event = SessionEvent::failed(FailureClass::StartupTimeout);
        assert_eq!(event.state, SessionState::Failed);
        assert_eq!(event.classification, Some(FailureClass::StartupTimeout));
        assert_eq!(
            event.message.as_deref(),
            Some(FailureClass::StartupTimeout.user_message())
        );
    }
}
