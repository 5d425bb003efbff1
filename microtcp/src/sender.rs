//! Send-side sliding window.
//!
//! [`Sender`] tracks every byte that has been transmitted but not yet
//! cumulatively acknowledged, together with the peer's advertised window.
//!
//! # Protocol contract
//!
//! - Bytes in flight never exceed `min(peer_window, cwnd)`; callers size each
//!   segment with [`Sender::next_segment_len`].
//! - ACKs are **cumulative**: `ack = K` means the peer has accepted every
//!   byte up to (but not including) sequence number `K`.
//! - On timeout the caller retransmits only the **oldest** unacknowledged
//!   segment; the receiver buffers out-of-order data, so one cumulative ACK
//!   can then retire several segments at once.
//! - The FIN occupies one sequence number after the last data byte.
//!
//! This module only manages state; all socket I/O is the caller's responsibility.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::packet::{flags, Packet};
use crate::seq::{seq_le, seq_lt};

/// A single in-flight segment awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// Sequence number of the first payload byte.
    pub seq: u32,
    pub payload: Vec<u8>,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
}

impl InFlight {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }
}

/// Our FIN, once sent.
#[derive(Debug, Clone)]
pub struct FinEntry {
    pub seq: u32,
    pub sent_at: Instant,
    pub acked: bool,
}

/// What an inbound acknowledgement did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The frontier moved forward by `bytes` data bytes (0 when only the
    /// FIN was acknowledged).
    Advanced { bytes: u32 },
    /// A pure ACK repeating the ack number and window while data is
    /// outstanding.
    Duplicate,
    /// Stale, out of range, or a pure window update.
    Ignored,
}

/// Send-side state for one connection.
///
/// # Sequence-number layout
///
/// ```text
///  snd_una            snd_nxt
///      │                  │
///  ────┼──────────────────┼──────────────────▶ seq space
///      │ <── in flight ──▶│ <── usable window ──▶
/// ```
#[derive(Debug)]
pub struct Sender {
    /// Oldest unacknowledged sequence number (left window edge).
    pub snd_una: u32,
    /// Sequence number to use for the next new segment.
    pub snd_nxt: u32,
    /// Window most recently advertised by the peer.
    peer_window: u32,
    mss: usize,
    /// In-flight segments ordered by sequence number (front = oldest).
    window: VecDeque<InFlight>,
    fin: Option<FinEntry>,
}

impl Sender {
    /// `seq_start` is the first data sequence number (`ISN + 1`).
    pub fn new(seq_start: u32, peer_window: u16, mss: usize) -> Self {
        Self {
            snd_una: seq_start,
            snd_nxt: seq_start,
            peer_window: u32::from(peer_window),
            mss: mss.max(1),
            window: VecDeque::new(),
            fin: None,
        }
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// Data bytes sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.window.iter().map(|e| e.payload.len() as u32).sum()
    }

    /// Number of segments awaiting acknowledgement.
    pub fn segments_in_flight(&self) -> usize {
        self.window.len()
    }

    /// `true` when at least one data segment is awaiting acknowledgement.
    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Bytes that may still be put on the wire under `cwnd` and the peer window.
    pub fn usable_window(&self, cwnd: u32) -> usize {
        self.peer_window.min(cwnd).saturating_sub(self.in_flight()) as usize
    }

    /// Size of the next segment for `remaining` bytes of application data.
    pub fn next_segment_len(&self, remaining: usize, cwnd: u32) -> usize {
        remaining.min(self.usable_window(cwnd)).min(self.mss)
    }

    /// Build a data segment with the correct next sequence number.
    ///
    /// Call [`record_sent`] immediately after transmission to advance
    /// `snd_nxt` and place the segment into the window.
    ///
    /// [`record_sent`]: Sender::record_sent
    pub fn build_data_packet(&self, payload: Vec<u8>, ack: u32, window: u16) -> Packet {
        // Data segments piggyback the receiver's ACK.
        Packet::new(self.snd_nxt, ack, flags::ACK, window, payload)
    }

    /// Place a just-transmitted data segment into the window.
    pub fn record_sent(&mut self, packet: Packet, now: Instant) {
        debug_assert_eq!(packet.header.seq, self.snd_nxt);
        debug_assert!(self.fin.is_none(), "data queued after FIN");
        let len = packet.payload.len() as u32;
        self.window.push_back(InFlight {
            seq: packet.header.seq,
            payload: packet.payload,
            sent_at: now,
        });
        self.snd_nxt = self.snd_nxt.wrapping_add(len);
    }

    /// Process a cumulative ACK carrying the peer's current `window`.
    ///
    /// Retires every segment whose data ends at or before `ack`, trims a
    /// partially acknowledged one, and marks the FIN acknowledged when
    /// `ack` covers it.  `pure` is false when the segment also carried data
    /// or a FIN; such a segment never counts as a duplicate.
    pub fn on_ack(&mut self, ack: u32, window: u16, pure: bool) -> AckOutcome {
        // Reject ACKs that are behind snd_una or beyond anything we sent.
        if !seq_le(self.snd_una, ack) || !seq_le(ack, self.snd_nxt) {
            return AckOutcome::Ignored;
        }
        let window = u32::from(window);
        let window_changed = window != self.peer_window;
        self.peer_window = window;

        if ack == self.snd_una {
            return if pure && self.has_unacked() && !window_changed {
                AckOutcome::Duplicate
            } else {
                AckOutcome::Ignored
            };
        }

        let mut bytes = 0u32;
        while let Some(front) = self.window.front_mut() {
            if seq_le(front.end(), ack) {
                bytes += front.payload.len() as u32;
                self.window.pop_front();
            } else {
                if seq_lt(front.seq, ack) {
                    let covered = ack.wrapping_sub(front.seq) as usize;
                    front.payload.drain(..covered);
                    front.seq = ack;
                    bytes += covered as u32;
                }
                break;
            }
        }
        if let Some(fin) = self.fin.as_mut() {
            if ack == fin.seq.wrapping_add(1) {
                fin.acked = true;
            }
        }
        self.snd_una = ack;
        AckOutcome::Advanced { bytes }
    }

    /// The oldest in-flight segment, if any.
    pub fn oldest(&self) -> Option<&InFlight> {
        self.window.front()
    }

    /// Rebuild the oldest segment for retransmission with the current `ack`
    /// and `window`, restarting its send time.
    pub fn retransmit_oldest(&mut self, ack: u32, window: u16, now: Instant) -> Option<Packet> {
        let entry = self.window.front_mut()?;
        entry.sent_at = now;
        Some(Packet::new(
            entry.seq,
            ack,
            flags::ACK,
            window,
            entry.payload.clone(),
        ))
    }

    /// Build our FIN|ACK.  It takes the sequence number after the last data byte.
    pub fn build_fin(&self, ack: u32, window: u16) -> Packet {
        Packet::new(self.snd_nxt, ack, flags::FIN | flags::ACK, window, Vec::new())
    }

    /// Record a just-transmitted FIN; it consumes one sequence number.
    pub fn record_fin(&mut self, now: Instant) {
        if self.fin.is_some() {
            return;
        }
        self.fin = Some(FinEntry {
            seq: self.snd_nxt,
            sent_at: now,
            acked: false,
        });
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
    }

    /// Our FIN, if it has been sent.
    pub fn fin(&self) -> Option<&FinEntry> {
        self.fin.as_ref()
    }

    pub fn fin_acked(&self) -> bool {
        self.fin.as_ref().is_some_and(|f| f.acked)
    }

    /// Rebuild an unacknowledged FIN for retransmission.
    pub fn retransmit_fin(&mut self, ack: u32, window: u16, now: Instant) -> Option<Packet> {
        let fin = self.fin.as_mut().filter(|f| !f.acked)?;
        fin.sent_at = now;
        Some(Packet::new(
            fin.seq,
            ack,
            flags::FIN | flags::ACK,
            window,
            Vec::new(),
        ))
    }

    /// Send time of whatever is oldest and unacknowledged: data first, then FIN.
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.window.front().map(|e| e.sent_at).or_else(|| {
            self.fin
                .as_ref()
                .filter(|f| !f.acked)
                .map(|f| f.sent_at)
        })
    }
}
