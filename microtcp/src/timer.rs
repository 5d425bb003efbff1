//! Retransmission timeout management.
//!
//! Reliable delivery requires that unacknowledged segments are re-sent if no
//! ACK arrives within a bounded time.  There is no timer task: the connection
//! asks [`RetransmitTimer::deadline`] for the instant at which the oldest
//! unacknowledged segment expires and bounds its next receive with it.
//!
//! The RTO starts at a fixed value, doubles on each consecutive timeout
//! (exponential back-off) up to a configurable maximum, and drops back to
//! the initial value as soon as new data is acknowledged.

use std::time::Duration;

use tokio::time::Instant;

/// Adjustable timeout parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerConfig {
    /// RTO used for a fresh connection and after every acknowledgement.
    pub initial_rto: Duration,
    /// Maximum RTO after repeated back-off.
    pub max_rto: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(200),
            max_rto: Duration::from_secs(4),
        }
    }
}

/// Retransmit timer state for one connection.
#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    config: TimerConfig,
    current_rto: Duration,
    /// Consecutive timeouts since the last forward progress.
    backoffs: u32,
}

impl RetransmitTimer {
    pub fn new(config: TimerConfig) -> Self {
        let current_rto = config.initial_rto;
        Self {
            config,
            current_rto,
            backoffs: 0,
        }
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    /// Number of consecutive back-offs since the last [`reset`].
    ///
    /// [`reset`]: RetransmitTimer::reset
    pub fn backoffs(&self) -> u32 {
        self.backoffs
    }

    /// Instant at which a segment last sent at `sent_at` should be resent.
    pub fn deadline(&self, sent_at: Instant) -> Instant {
        sent_at + self.current_rto
    }

    /// Double the RTO on retransmit timeout, capped at `config.max_rto`.
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.config.max_rto);
        self.backoffs += 1;
    }

    /// Restore the initial RTO after forward progress.
    pub fn reset(&mut self) {
        self.current_rto = self.config.initial_rto;
        self.backoffs = 0;
    }
}
