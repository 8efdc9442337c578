//! Proactor configuration and tuning
//!
//! This module provides the configuration knobs for the proactor's poll loop
//! and its worker threads. The `ProactorConfig` struct allows tuning the
//! trade-off between wake-up latency and idle CPU usage.
//!
//! # Tuning Categories
//!
//! ## Latency
//! - `poll_timeout_ms`: Upper bound on how long one poll cycle may block
//! - `max_backoff_ms`: Cap on the adaptive idle sleep between cycles
//!
//! ## Capacity
//! - `event_capacity`: Readiness events drained per poll cycle
//!
//! # Examples
//!
//! ```rust
//! use socket_proactor::ProactorConfig;
//!
//! // Aggressive wake-up latency at the cost of idle CPU
//! let low_latency = ProactorConfig {
//!     poll_timeout_ms: 1,
//!     max_backoff_ms: 5,
//!     ..Default::default()
//! };
//!
//! // Relaxed polling for background services
//! let power_efficient = ProactorConfig::power_efficient();
//! # let _ = (low_latency, power_efficient);
//! ```

use std::time::Duration;

/// Configuration for a [`SocketProactor`](crate::SocketProactor)
///
/// All parameters have sensible defaults. The two timeout knobs interact:
/// `poll_timeout_ms` bounds how long the readiness poll itself blocks,
/// while `max_backoff_ms` caps the extra sleep inserted between cycles
/// that produced no work. Both default to 250 ms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProactorConfig {
    /// Readiness-poll timeout in milliseconds
    ///
    /// One `poll()` cycle blocks at most this long waiting for socket
    /// events. A `wake_up()` or a new registration interrupts the wait.
    ///
    /// **Default**: `250`
    pub poll_timeout_ms: u64,

    /// Cap on the adaptive idle backoff in milliseconds
    ///
    /// After an unproductive cycle the loop sleeps 1 ms, then doubles the
    /// sleep each further unproductive cycle up to this cap; any completed
    /// work resets the sleep to zero. The completion thread uses the same
    /// schedule for its queue wait.
    ///
    /// **Default**: `250`
    pub max_backoff_ms: u64,

    /// Number of readiness events drained per poll cycle
    ///
    /// Sockets beyond this many simultaneously-ready descriptors are
    /// picked up on the next cycle.
    ///
    /// **Default**: `4096`
    pub event_capacity: usize,

    /// Whether to start the optional work-executor thread
    ///
    /// When enabled, a dedicated thread drains the work schedule
    /// alongside the poll loop, so scheduled entries make progress even
    /// while `run()` is blocked in the readiness poll or not running at
    /// all. Completion callbacks are unaffected by this flag; their
    /// worker always runs.
    ///
    /// **Default**: `true`
    pub worker: bool,
}

impl Default for ProactorConfig {
    /// Creates the default configuration: 250 ms poll timeout and backoff
    /// cap, 4096-event capacity, work executor enabled.
    fn default() -> Self {
        Self {
            poll_timeout_ms: 250,
            max_backoff_ms: 250,
            event_capacity: 4096,
            worker: true,
        }
    }
}

impl ProactorConfig {
    /// Creates a configuration optimized for wake-up latency
    ///
    /// Poll cycles block for at most 1 ms and idle backoff is capped at
    /// 5 ms, keeping dispatch latency low while idle at the cost of more
    /// frequent wakeups.
    pub fn low_latency() -> Self {
        Self {
            poll_timeout_ms: 1,
            max_backoff_ms: 5,
            event_capacity: 4096,
            worker: true,
        }
    }

    /// Creates a configuration for power-efficient operation
    ///
    /// Longer poll timeouts and a 500 ms backoff cap minimize wakeups for
    /// background services where dispatch latency is not critical.
    pub fn power_efficient() -> Self {
        Self {
            poll_timeout_ms: 500,
            max_backoff_ms: 500,
            event_capacity: 1024,
            worker: false,
        }
    }

    pub(crate) fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProactorConfig::default();
        assert_eq!(config.poll_timeout_ms, 250);
        assert_eq!(config.max_backoff_ms, 250);
        assert_eq!(config.event_capacity, 4096);
        assert!(config.worker);
    }

    #[test]
    fn test_low_latency_config() {
        let config = ProactorConfig::low_latency();
        assert_eq!(config.poll_timeout_ms, 1);
        assert!(config.max_backoff_ms <= 10);
    }

    #[test]
    fn test_power_efficient_config() {
        let config = ProactorConfig::power_efficient();
        assert!(config.poll_timeout_ms >= 250);
        assert!(!config.worker);
    }

    #[test]
    fn test_config_clone() {
        let config1 = ProactorConfig::low_latency();
        let config2 = config1.clone();
        assert_eq!(config1, config2);
    }
}
