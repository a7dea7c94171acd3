// ABOUTME: Resource watchdog primitives for supervised preview sessions
// ABOUTME: Single cancellable startup deadline plus per-chunk OOM output scanner

use crate::classifier::OOM_SIGNATURES;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Sleep};
use tracing::debug;

/// Single-shot wall-clock budget covering the Installing and Starting
/// phases together. Armed once when Installing begins, never reset between
/// phases, disarmed the instant Running is entered.
///
/// Untrusted code can hang or spin; the deadline bounds startup time
/// independently of anything the guest reports about itself.
pub struct StartupDeadline {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl StartupDeadline {
    pub fn arm(budget: Duration) -> Self {
        debug!("Arming startup deadline for {:?}", budget);
        Self {
            sleep: Box::pin(sleep(budget)),
            armed: true,
        }
    }

    /// Disarming is permanent; an expired-but-disarmed deadline can no
    /// longer cause a transition.
    pub fn disarm(&mut self) {
        if self.armed {
            debug!("Startup deadline disarmed");
        }
        self.armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Resolves when the budget elapses. Never resolves once disarmed, so
    /// it can sit in a `select!` loop unconditionally.
    pub async fn expired(&mut self) {
        if !self.armed {
            futures::future::pending::<()>().await;
        }
        self.sleep.as_mut().await;
    }
}

/// Scans guest output chunks for fatal-memory signatures, short-circuiting
/// the normal exit-code path.
pub struct OutputScanner;

impl OutputScanner {
    /// Returns the matched signature when a chunk indicates heap
    /// exhaustion.
    pub fn scan(chunk: &str) -> Option<&'static str> {
        OOM_SIGNATURES.iter().find(|sig| chunk.contains(*sig)).copied()
    }
}
