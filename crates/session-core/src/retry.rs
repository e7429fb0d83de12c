use std::time::Duration;

/// Reconnect pacing for the session loading loop.
///
/// The live channel is retried on a fixed interval rather than exponential
/// backoff: each attempt re-runs the full loading sequence and a success
/// cancels any pending retry, so unbounded attempt counts stay cheap.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    interval_ms: u64,
}

impl ReconnectPolicy {
    /// Create a policy with the given interval (`interval_ms >= 1`).
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Delay before the next attempt; identical for every attempt.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(5_000)
    }
}
