//! Block device configuration.

use std::time::Duration;

/// Tunables for an open device's completion polling.
///
/// The defaults suit tests and moderate request rates. Latency-sensitive
/// deployments shrink `poll_wait` toward zero (a zero wait busy-polls).
#[derive(Debug, Clone)]
pub struct BdevConfig {
    /// Maximum completions reaped per poll.
    pub poll_batch: usize,
    /// Longest a single poll waits for the first completion. Bounds how
    /// stale a shutdown request can go unnoticed.
    pub poll_wait: Duration,
}

impl Default for BdevConfig {
    fn default() -> Self {
        Self {
            poll_batch: 32,
            poll_wait: Duration::from_millis(1),
        }
    }
}
