//! Slow start / congestion avoidance state machine.
//!
//! All quantities are in bytes.  The sender consults [`CongestionControl::cwnd`]
//! before every transmission and reports three kinds of events:
//!
//! - an ACK that advances the acknowledged frontier ([`on_ack`]),
//! - a duplicate ACK ([`on_duplicate_ack`]), which after `dup_ack_threshold`
//!   repetitions is treated as a loss and triggers a fast retransmit,
//! - a retransmission timeout ([`on_timeout`]).
//!
//! [`on_ack`]: CongestionControl::on_ack
//! [`on_duplicate_ack`]: CongestionControl::on_duplicate_ack
//! [`on_timeout`]: CongestionControl::on_timeout

use crate::config::Config;

/// Largest congestion window worth keeping: the biggest window a peer can
/// advertise in the 16-bit header field.
const MAX_CWND: u32 = u16::MAX as u32;

/// Which growth rule currently applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// `cwnd < ssthresh`: one MSS per acknowledgement.
    SlowStart,
    /// `cwnd >= ssthresh`: roughly one MSS per round trip.
    CongestionAvoidance,
}

#[derive(Debug, Clone)]
pub struct CongestionControl {
    mss: u32,
    cwnd: u32,
    ssthresh: u32,
    initial_cwnd: u32,
    min_ssthresh: u32,
    dup_ack_threshold: u32,
    duplicate_acks: u32,
}

impl CongestionControl {
    pub fn new(config: &Config) -> Self {
        Self {
            mss: config.segment_size() as u32,
            cwnd: config.initial_cwnd.min(MAX_CWND),
            ssthresh: config.initial_ssthresh,
            initial_cwnd: config.initial_cwnd.min(MAX_CWND),
            min_ssthresh: config.min_ssthresh,
            dup_ack_threshold: config.dup_ack_threshold.max(1),
            duplicate_acks: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn phase(&self) -> Phase {
        if self.cwnd < self.ssthresh {
            Phase::SlowStart
        } else {
            Phase::CongestionAvoidance
        }
    }

    /// New data was acknowledged: grow the window.
    pub fn on_ack(&mut self) {
        self.duplicate_acks = 0;
        let increase = match self.phase() {
            Phase::SlowStart => self.mss,
            // Additive increase: mss²/cwnd per ACK sums to ~1 MSS per RTT.
            Phase::CongestionAvoidance => {
                let mss = u64::from(self.mss);
                let step = (mss * mss / u64::from(self.cwnd.max(1))).max(1);
                step.min(u64::from(MAX_CWND)) as u32
            }
        };
        self.cwnd = self.cwnd.saturating_add(increase).min(MAX_CWND);
    }

    /// A duplicate ACK arrived while data is outstanding.
    ///
    /// Returns `true` exactly when the duplicate count reaches the threshold;
    /// the caller should then retransmit the oldest unacknowledged segment.
    pub fn on_duplicate_ack(&mut self) -> bool {
        self.duplicate_acks += 1;
        if self.duplicate_acks != self.dup_ack_threshold {
            return false;
        }
        self.ssthresh = self.halved_window();
        self.cwnd = self.cwnd.min(self.ssthresh);
        log::debug!(
            "[cc] {} duplicate ACKs; cwnd={} ssthresh={}",
            self.duplicate_acks,
            self.cwnd,
            self.ssthresh
        );
        true
    }

    /// The oldest segment timed out: back to slow start from the initial window.
    pub fn on_timeout(&mut self) {
        self.duplicate_acks = 0;
        self.ssthresh = self.halved_window();
        self.cwnd = self.initial_cwnd;
        log::debug!("[cc] timeout; cwnd={} ssthresh={}", self.cwnd, self.ssthresh);
    }

    fn halved_window(&self) -> u32 {
        (self.cwnd / 2).max(self.min_ssthresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc() -> CongestionControl {
        CongestionControl::new(&Config::default())
    }

    #[test]
    fn starts_in_slow_start() {
        let c = cc();
        assert_eq!(c.cwnd(), 4200);
        assert_eq!(c.ssthresh(), 8192);
        assert_eq!(c.phase(), Phase::SlowStart);
    }

    #[test]
    fn slow_start_adds_one_mss_per_ack() {
        let mut c = cc();
        c.on_ack();
        assert_eq!(c.cwnd(), 5600);
        c.on_ack();
        assert_eq!(c.cwnd(), 7000);
        c.on_ack();
        assert_eq!(c.cwnd(), 8400);
        assert_eq!(c.phase(), Phase::CongestionAvoidance);
    }

    #[test]
    fn congestion_avoidance_grows_additively() {
        let mut c = cc();
        for _ in 0..3 {
            c.on_ack();
        }
        let before = c.cwnd();
        c.on_ack();
        let growth = c.cwnd() - before;
        assert!(growth > 0 && growth < 1400, "growth was {growth}");
    }

    #[test]
    fn cwnd_never_decreases_on_acks() {
        let mut c = cc();
        let mut last = c.cwnd();
        for _ in 0..2000 {
            c.on_ack();
            assert!(c.cwnd() >= last);
            last = c.cwnd();
        }
        assert_eq!(c.cwnd(), MAX_CWND);
    }

    #[test]
    fn timeout_halves_ssthresh_and_resets_cwnd() {
        let mut c = cc();
        for _ in 0..5 {
            c.on_ack();
        }
        let before = c.cwnd();
        c.on_timeout();
        assert_eq!(c.cwnd(), 4200);
        assert_eq!(c.ssthresh(), before / 2);
    }

    #[test]
    fn consecutive_timeouts_are_non_increasing() {
        let mut c = cc();
        for _ in 0..10 {
            c.on_ack();
        }
        let (mut cwnd, mut ssthresh) = (c.cwnd(), c.ssthresh());
        for _ in 0..8 {
            c.on_timeout();
            assert!(c.cwnd() <= cwnd);
            assert!(c.ssthresh() <= ssthresh);
            assert!(c.ssthresh() >= 2800);
            cwnd = c.cwnd();
            ssthresh = c.ssthresh();
        }
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit() {
        let mut c = cc();
        assert!(!c.on_duplicate_ack());
        assert!(!c.on_duplicate_ack());
        assert!(c.on_duplicate_ack());
        // Further duplicates of the same loss do not retrigger.
        assert!(!c.on_duplicate_ack());
        assert_eq!(c.ssthresh(), 2800);
        assert_eq!(c.cwnd(), 2800);
    }

    #[test]
    fn timeout_after_fast_retransmit_restarts_from_initial_window() {
        let mut c = cc();
        for _ in 0..3 {
            c.on_duplicate_ack();
        }
        assert_eq!(c.cwnd(), 2800);
        c.on_timeout();
        assert_eq!(c.cwnd(), 4200);
        assert_eq!(c.ssthresh(), 2800);
        assert_eq!(c.phase(), Phase::CongestionAvoidance);
    }

    #[test]
    fn avoidance_step_with_jumbo_mss_does_not_overflow() {
        let config = Config {
            mss: 1 << 20,
            initial_cwnd: 60_000,
            initial_ssthresh: 1,
            ..Config::default()
        };
        let mut c = CongestionControl::new(&config);
        assert_eq!(c.phase(), Phase::CongestionAvoidance);
        c.on_ack();
        assert_eq!(c.cwnd(), MAX_CWND);
    }

    #[test]
    fn new_ack_clears_duplicate_count() {
        let mut c = cc();
        c.on_duplicate_ack();
        c.on_duplicate_ack();
        c.on_ack();
        assert!(!c.on_duplicate_ack());
    }
}
