//! Wall clock driven by tokio time.

use chrono::{DateTime, Utc};
use session_core::env::Clock;
use tokio::time::Instant;

/// [`Clock`] that advances with tokio time, including paused test time.
///
/// Anchored to the real wall clock when created, so tokens minted with real
/// timestamps line up with the controller's view of "now".
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    /// Anchor the clock at the current time.
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            start: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }
}
