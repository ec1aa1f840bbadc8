//! Bridge configuration.
//!
//! The core never parses configuration itself. Hosts build a [`BridgeConfig`]
//! (from CLI flags, a file, whatever they own) and hand it in; the core only
//! validates it.

use crate::error::{BridgeError, Result};
use std::time::Duration;

/// Default values for [`BridgeConfig`].
pub struct BridgeDefaults;

impl BridgeDefaults {
    pub const HEARTBEAT_MISS_THRESHOLD: u32 = 3;
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
    pub const QUEUE_CAPACITY: usize = 64;
    /// Script compilation plus domain reload on a large project.
    pub const COMPILE_GRACE: Duration = Duration::from_secs(120);
    pub const RECONNECT_WAIT: Duration = Duration::from_secs(5);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Editor link limits.
pub struct LinkConfig;

impl LinkConfig {
    /// Maximum size of a single link frame (16 MiB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    /// Maximum concurrently open editor sockets (active plus candidates).
    pub const MAX_EDITOR_SOCKETS: usize = 8;
    /// Buffered outbound frames per connection.
    pub const OUTBOUND_BUFFER: usize = 32;
    /// Protocol version announced in `welcome`.
    pub const PROTOCOL_VERSION: u32 = 1;
}

/// Runtime configuration injected into the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Consecutive missed pings that close the active connection.
    pub heartbeat_miss_threshold: u32,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Capacity of the admission queue.
    pub queue_capacity: usize,
    /// Wait bound while the editor is compiling or reloading.
    pub compile_grace: Duration,
    /// Wait bound after an unexpected disconnect.
    pub reconnect_wait: Duration,
    /// Time a fresh socket has to send `hello`.
    pub handshake_timeout: Duration,
    /// Time the editor has to answer a dispatched request.
    pub request_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_miss_threshold: BridgeDefaults::HEARTBEAT_MISS_THRESHOLD,
            heartbeat_interval: BridgeDefaults::HEARTBEAT_INTERVAL,
            queue_capacity: BridgeDefaults::QUEUE_CAPACITY,
            compile_grace: BridgeDefaults::COMPILE_GRACE,
            reconnect_wait: BridgeDefaults::RECONNECT_WAIT,
            handshake_timeout: BridgeDefaults::HANDSHAKE_TIMEOUT,
            request_timeout: BridgeDefaults::REQUEST_TIMEOUT,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_miss_threshold(mut self, threshold: u32) -> Self {
        self.heartbeat_miss_threshold = threshold;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_compile_grace(mut self, grace: Duration) -> Self {
        self.compile_grace = grace;
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Reject values the bridge cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_miss_threshold == 0 {
            return Err(BridgeError::config(
                "heartbeat_miss_threshold",
                "must be at least 1",
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(BridgeError::config("heartbeat_interval", "must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(BridgeError::config(
                "queue_capacity",
                "must be greater than 0",
            ));
        }
        if self.handshake_timeout.is_zero() {
            return Err(BridgeError::config("handshake_timeout", "must be non-zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(BridgeError::config("request_timeout", "must be non-zero"));
        }
        if self.compile_grace < self.reconnect_wait {
            return Err(BridgeError::config(
                "compile_grace",
                format!(
                    "must not be shorter than reconnect_wait ({:?} < {:?})",
                    self.compile_grace, self.reconnect_wait
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = BridgeConfig::new()
            .with_heartbeat_miss_threshold(0)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Config { ref field, .. } if field == "heartbeat_miss_threshold"
        ));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = BridgeConfig::new()
            .with_queue_capacity(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config { ref field, .. } if field == "queue_capacity"));
    }

    #[test]
    fn test_grace_shorter_than_reconnect_wait_rejected() {
        let config = BridgeConfig::new()
            .with_compile_grace(Duration::from_secs(1))
            .with_reconnect_wait(Duration::from_secs(2));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(BridgeConfig::new()
            .with_heartbeat_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BridgeConfig::new()
            .with_handshake_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(BridgeConfig::new()
            .with_request_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }
}
