//! Tunable protocol parameters.

use std::time::Duration;

use crate::packet::HEADER_LEN;
use crate::socket::MAX_DATAGRAM;
use crate::timer::TimerConfig;

/// Default maximum segment payload.
pub const DEFAULT_MSS: usize = 1400;
/// Default receive-buffer capacity, which is also the initial advertised window.
pub const DEFAULT_RECV_BUFFER_LEN: usize = 8192;
/// Largest payload that still fits one datagram behind the header.
pub const MAX_MSS: usize = MAX_DATAGRAM - HEADER_LEN;

/// Per-connection configuration.
///
/// Every timeout and threshold the engine uses lives here so tests and the
/// demo binary can tighten or relax them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes per segment.  Read through
    /// [`Config::segment_size`], which keeps it within one datagram.
    pub mss: usize,
    /// Receive-buffer capacity in bytes.
    pub recv_buffer_len: usize,
    /// Congestion window at connection start and after a timeout.
    pub initial_cwnd: u32,
    /// Slow-start threshold at connection start.
    pub initial_ssthresh: u32,
    /// Lower bound for `ssthresh` after a loss.
    pub min_ssthresh: u32,
    /// Duplicate ACKs that trigger a fast retransmit.
    pub dup_ack_threshold: u32,
    /// Retransmission timeout parameters.
    pub timer: TimerConfig,
    /// Consecutive timeouts of one segment (data or FIN) before giving up.
    pub max_retries: u32,
    /// Wait for a SYN-ACK (client) or final ACK (server) before resending.
    pub handshake_timeout: Duration,
    /// SYN / SYN-ACK retransmissions before the handshake is abandoned.
    pub handshake_retries: u32,
    /// Linger after the last ACK of an actively closed connection.
    pub time_wait: Duration,
    /// Longest silence tolerated from a peer that acknowledged our FIN but
    /// has not sent its own; the connection is then closed anyway.
    pub fin_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let mss = DEFAULT_MSS;
        Self {
            mss,
            recv_buffer_len: DEFAULT_RECV_BUFFER_LEN,
            initial_cwnd: 3 * mss as u32,
            initial_ssthresh: DEFAULT_RECV_BUFFER_LEN as u32,
            min_ssthresh: 2 * mss as u32,
            dup_ack_threshold: 3,
            timer: TimerConfig::default(),
            max_retries: 12,
            handshake_timeout: Duration::from_millis(500),
            handshake_retries: 5,
            time_wait: Duration::from_millis(400),
            fin_wait_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Largest window this endpoint can ever advertise.
    pub fn window(&self) -> u16 {
        self.recv_buffer_len.min(usize::from(u16::MAX)) as u16
    }

    /// `mss` clamped to `1..=MAX_MSS`.
    pub fn segment_size(&self) -> usize {
        self.mss.clamp(1, MAX_MSS)
    }
}
