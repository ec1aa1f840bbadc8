//! Consecutive-miss liveness counter for the active editor connection.
//!
//! One monitor belongs to exactly one connection task. It is never shared and
//! is dropped together with the connection, so a replacement socket always
//! starts again from zero misses.

use tracing::{debug, warn};

/// Heartbeat miss counter with a close threshold.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    /// Number of consecutive misses that closes the connection.
    threshold: u32,
    /// Consecutive misses since the last answered ping.
    misses: u32,
}

impl HeartbeatMonitor {
    /// Create a monitor that signals a close on the `threshold`-th
    /// consecutive miss. A threshold of 0 is clamped to 1.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            misses: 0,
        }
    }

    /// Record the outcome of one ping.
    ///
    /// Returns `true` exactly on the miss that reaches the threshold. Later
    /// misses return `false` again; the caller is expected to close on the
    /// first `true` and discard the monitor.
    pub fn register_probe_result(&mut self, success: bool) -> bool {
        if success {
            if self.misses > 0 {
                debug!("Heartbeat recovered after {} missed ping(s)", self.misses);
            }
            self.misses = 0;
            return false;
        }

        self.misses = self.misses.saturating_add(1);
        if self.misses == self.threshold {
            warn!(
                "Heartbeat missed {} consecutive ping(s), closing connection",
                self.misses
            );
            true
        } else {
            debug!("Heartbeat miss {}/{}", self.misses, self.threshold);
            false
        }
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
