//! Per-connection traffic counters.

use std::fmt;

/// Monotonic counters owned by one [`crate::connection::Connection`].
///
/// Byte counters track payload bytes only; control segments count as
/// packets with zero bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Segments presumed lost and retransmitted (timeout or duplicate ACKs).
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_lost: u64,
}

impl Statistics {
    pub fn record_sent(&mut self, payload_len: usize) {
        self.packets_sent += 1;
        self.bytes_sent += payload_len as u64;
    }

    pub fn record_received(&mut self, payload_len: usize) {
        self.packets_received += 1;
        self.bytes_received += payload_len as u64;
    }

    pub fn record_lost(&mut self, payload_len: usize) {
        self.packets_lost += 1;
        self.bytes_lost += payload_len as u64;
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packets sent={} received={} lost={}; bytes sent={} received={} lost={}",
            self.packets_sent,
            self.packets_received,
            self.packets_lost,
            self.bytes_sent,
            self.bytes_received,
            self.bytes_lost
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut s = Statistics::default();
        s.record_sent(10);
        s.record_sent(0);
        s.record_received(4);
        s.record_lost(10);

        assert_eq!(s.packets_sent, 2);
        assert_eq!(s.bytes_sent, 10);
        assert_eq!(s.packets_received, 1);
        assert_eq!(s.bytes_received, 4);
        assert_eq!(s.packets_lost, 1);
        assert_eq!(s.bytes_lost, 10);
    }
}
