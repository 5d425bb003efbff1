//! Receive half of a connection.
//!
//! In-order payload goes into a bounded application buffer; segments that
//! arrive past a gap wait in a `BTreeMap` keyed by sequence number and are
//! drained into the buffer once `rcv_nxt` reaches them.  Duplicates are
//! dropped and overlapping segments trimmed.  The application only ever
//! sees contiguous bytes.
//!
//! Nothing here transmits; [`crate::connection::Connection`] reads
//! [`Receiver::ack_number`] and [`Receiver::window_size`] when it builds an
//! ACK.

use std::collections::{BTreeMap, VecDeque};

use crate::seq::{seq_le, seq_lt};

/// How an inbound FIN relates to the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinOutcome {
    /// The FIN follows the last delivered byte; `rcv_nxt` moved past it.
    Accepted,
    /// A retransmission of a FIN we already consumed.
    Duplicate,
    /// The FIN is ahead of a gap in the data; it will be retransmitted.
    OutOfOrder,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    /// Contiguous bytes the application has not read yet.
    app_buffer: VecDeque<u8>,
    /// Byte capacity of `app_buffer`.
    capacity: usize,
    /// Segments received ahead of `rcv_nxt`, keyed by sequence number.
    out_of_order: BTreeMap<u32, Vec<u8>>,
    fin_received: bool,
}

impl Receiver {
    /// `rcv_nxt` is the first sequence number expected from the peer; after
    /// a completed handshake this is `peer_isn + 1`.
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            app_buffer: VecDeque::with_capacity(capacity),
            capacity,
            out_of_order: BTreeMap::new(),
            fin_received: false,
        }
    }

    /// Process an inbound data segment.
    ///
    /// Returns the number of bytes newly appended to the application buffer,
    /// including any out-of-order data the segment made contiguous.  Data
    /// that does not fit the free buffer space is left for the sender to
    /// retransmit.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> usize {
        if payload.is_empty() || self.fin_received {
            return 0;
        }
        let end = seq.wrapping_add(payload.len() as u32);
        if seq_le(end, self.rcv_nxt) {
            // Entirely old data.
            return 0;
        }

        if seq_le(seq, self.rcv_nxt) {
            // In order, possibly with an already-delivered prefix.
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            let delivered = self.deliver(&payload[skip..]);
            return delivered + self.drain_out_of_order();
        }

        // Ahead of rcv_nxt: hold it if it fits the buffer space.
        let offset = seq.wrapping_sub(self.rcv_nxt) as usize;
        if offset + payload.len() <= self.free_space() {
            self.out_of_order
                .entry(seq)
                .or_insert_with(|| payload.to_vec());
        }
        0
    }

    /// Advance `RCV.NXT` past a received FIN, which consumes one sequence
    /// number without delivering payload.
    pub fn on_fin(&mut self, fin_seq: u32) -> FinOutcome {
        if self.fin_received {
            return FinOutcome::Duplicate;
        }
        if fin_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.fin_received = true;
            self.out_of_order.clear();
            FinOutcome::Accepted
        } else if seq_lt(fin_seq, self.rcv_nxt) {
            FinOutcome::Duplicate
        } else {
            FinOutcome::OutOfOrder
        }
    }

    /// `true` once the peer's FIN has been consumed.
    pub fn fin_received(&self) -> bool {
        self.fin_received
    }

    /// Value for the `ack` field of the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised receive window: free buffer space, clamped to the header field.
    pub fn window_size(&self) -> u16 {
        self.free_space().min(usize::from(u16::MAX)) as u16
    }

    /// Bytes buffered and not yet read by the application.
    pub fn fill_level(&self) -> usize {
        self.app_buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.app_buffer.is_empty()
    }

    /// Number of segments held out of order.
    pub fn out_of_order_segments(&self) -> usize {
        self.out_of_order.len()
    }

    /// Move buffered bytes into `buf`, returning how many were moved.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.app_buffer.len());
        let (head, tail) = self.app_buffer.as_slices();
        let from_head = n.min(head.len());
        buf[..from_head].copy_from_slice(&head[..from_head]);
        buf[from_head..n].copy_from_slice(&tail[..n - from_head]);
        self.app_buffer.drain(..n);
        n
    }

    fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.app_buffer.len())
    }

    fn deliver(&mut self, bytes: &[u8]) -> usize {
        let take = bytes.len().min(self.free_space());
        self.app_buffer.extend(&bytes[..take]);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
        take
    }

    /// Move held segments that became contiguous into the application buffer.
    fn drain_out_of_order(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let rcv_nxt = self.rcv_nxt;
            // Forget anything the stream has already moved past.
            self.out_of_order
                .retain(|&seq, data| seq_lt(rcv_nxt, seq.wrapping_add(data.len() as u32)));

            let next = self
                .out_of_order
                .keys()
                .copied()
                .find(|&seq| seq_le(seq, rcv_nxt));
            let Some(seq) = next else {
                return delivered;
            };
            let Some(data) = self.out_of_order.remove(&seq) else {
                return delivered;
            };
            let skip = rcv_nxt.wrapping_sub(seq) as usize;
            let n = self.deliver(&data[skip..]);
            delivered += n;
            if n < data.len() - skip {
                // Buffer full; the sender will retransmit the rest.
                return delivered;
            }
        }
    }
}
