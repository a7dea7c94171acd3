use crate::types::FailureClass;

/// Output signatures emitted by a Node guest hitting its heap ceiling.
/// Matched per chunk by the watchdog scanner and against the retained tail
/// on exit.
pub const OOM_SIGNATURES: [&str; 4] = [
    "JavaScript heap out of memory",
    "Reached heap limit",
    "FATAL ERROR",
    "ENOMEM",
];

/// Conventional exit code for a process killed by SIGKILL (128 + 9),
/// how an OOM kill presents itself.
const EXIT_OOM_KILLED: i32 = 137;

/// Conventional exit code for a process stopped by an external timeout
/// wrapper (128 + SIGTERM via `timeout(1)`).
const EXIT_TIMED_OUT: i32 = 124;

/// Check a piece of guest output for a fatal-memory signature.
pub fn contains_oom_signature(text: &str) -> bool {
    OOM_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// Map an exit code plus the retained output tail to a failure class.
///
/// Text matching here is heuristic by nature; anything that does not match
/// a known signal falls through to `Unknown` rather than guessing.
pub fn classify(exit_code: Option<i32>, running_reached: bool, tail: &str) -> FailureClass {
    if contains_oom_signature(tail) || tail.contains("SIGKILL") {
        return FailureClass::MemoryExceeded;
    }

    match exit_code {
        Some(EXIT_OOM_KILLED) => FailureClass::MemoryExceeded,
        Some(EXIT_TIMED_OUT) => FailureClass::StartupTimeout,
        Some(0) if running_reached => FailureClass::Ok,
        Some(1) if !running_reached => FailureClass::LaunchFailure,
        Some(code) if code != 0 => FailureClass::RuntimeError,
        _ => FailureClass::Unknown,
    }
}
