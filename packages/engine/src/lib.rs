//! Sandlot Engine - sandboxed preview execution for untrusted app bundles
//!
//! Takes a source bundle, mounts it into an isolated runtime, installs
//! dependencies, starts the app's entry command, and supervises it under a
//! wall-clock startup budget and a memory ceiling. The caller receives a
//! stream of state-change events ending in a live preview URL or a
//! classified, user-safe failure.

pub mod buffer;
pub mod bundle;
pub mod classifier;
pub mod process;
pub mod runtime;
pub mod session;
pub mod supervisor;
pub mod types;
pub mod watchdog;

// Re-export key types for easier use
pub use buffer::OutputBuffer;
pub use bundle::{EntryCommands, Manifest, SourceBundle};
pub use classifier::classify;
pub use process::ProcessRuntime;
pub use runtime::{GuestEvent, GuestProcess, MountHandle, SandboxRuntime, StreamKind};
pub use session::{PreflightGate, PreviewSession, SessionManager};
pub use types::{
    EngineError, EngineResult, FailureClass, ResourceLimits, SessionEvent, SessionState,
};

/// Version information for the engine crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
