//! Per-connection protocol engine.
//!
//! A [`Connection`] owns the complete state for one peer-to-peer session:
//!
//! ```text
//!  Application
//!      │  send / send_all / flush / recv / shutdown
//!      ▼
//!  Connection
//!    ├── Sender             (sliding window, in-flight segments, FIN)
//!    ├── Receiver           (app buffer, out-of-order store, RCV.NXT)
//!    ├── CongestionControl  (cwnd / ssthresh)
//!    ├── RetransmitTimer    (RTO with exponential back-off)
//!    ├── Statistics
//!    └── Link<C>            (its own channel, or its peer's share of a listener's)
//! ```
//!
//! There is no background task.  Every blocking operation drives the
//! protocol itself: it waits for the next segment from the peer, bounded by
//! the retransmission deadline of the oldest unacknowledged segment, and
//! handles the expiry inline.  The handshake lives in [`crate::handshake`]
//! and the FIN exchange in [`crate::teardown`]; both are further `impl`
//! blocks on this type.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::time::{timeout_at, Instant};

use crate::config::Config;
use crate::congestion::CongestionControl;
use crate::demux::Link;
use crate::packet::{flags, Packet};
use crate::receiver::Receiver;
use crate::sender::{AckOutcome, Sender};
use crate::seq::seq_lt;
use crate::socket::{Channel, Socket, MAX_DATAGRAM};
use crate::state::ConnectionState;
use crate::stats::Statistics;
use crate::timer::RetransmitTimer;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by connection operations.
///
/// Malformed or corrupted datagrams never show up here; they are logged and
/// dropped.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The underlying channel failed, or the peer stopped answering.
    #[error("channel error: {0}")]
    Channel(#[from] io::Error),

    /// The operation is not valid in the connection's current state.
    #[error("operation not valid in state {0}")]
    InvalidState(ConnectionState),

    /// No SYN-ACK arrived after every SYN transmission.
    #[error("handshake timed out after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },

    /// `send` / `recv` on a connection that is not open.
    #[error("not connected (state {0})")]
    NotConnected(ConnectionState),
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A reliable, ordered byte stream to a single peer.
///
/// Create one with [`Connection::open`] and call
/// [`connect`](Connection::connect), or obtain an established one from
/// [`crate::handshake::Listener::accept`].
pub struct Connection<C: Channel = Socket> {
    pub(crate) state: ConnectionState,
    pub(crate) sender: Sender,
    pub(crate) receiver: Receiver,
    pub(crate) congestion: CongestionControl,
    pub(crate) stats: Statistics,
    pub(crate) timer: RetransmitTimer,
    pub(crate) link: Link<C>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) config: Config,
    /// Scratch buffer for inbound datagrams.
    rx_buf: Vec<u8>,
    /// Last time the acknowledged frontier moved; restarts the RTO clock.
    last_progress: Instant,
    /// Set while blocked on a zero peer window with nothing in flight.
    persist_at: Option<Instant>,
    /// Window carried by the most recent segment we sent.
    last_window: u16,
}

impl<C: Channel> Connection<C> {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Wrap `channel` in a new connection in the [`ConnectionState::Closed`] state.
    pub fn open(channel: C, config: Config) -> Self {
        Self::with_link(Link::Direct(channel), config)
    }

    pub(crate) fn with_link(link: Link<C>, config: Config) -> Self {
        let mss = config.segment_size();
        Self {
            state: ConnectionState::Closed,
            sender: Sender::new(0, 0, mss),
            receiver: Receiver::new(0, config.recv_buffer_len),
            congestion: CongestionControl::new(&config),
            stats: Statistics::default(),
            timer: RetransmitTimer::new(config.timer.clone()),
            link,
            peer: None,
            rx_buf: vec![0u8; MAX_DATAGRAM],
            last_progress: Instant::now(),
            persist_at: None,
            last_window: config.window(),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Sequence number of the next byte we will send (`SND.NXT`).
    pub fn local_sequence(&self) -> u32 {
        self.sender.snd_nxt
    }

    /// Next sequence number expected from the peer (`RCV.NXT`).
    pub fn local_ack(&self) -> u32 {
        self.receiver.rcv_nxt
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.link.channel().local_addr()
    }

    pub fn stats(&self) -> Statistics {
        self.stats
    }

    pub fn cwnd(&self) -> u32 {
        self.congestion.cwnd()
    }

    pub fn ssthresh(&self) -> u32 {
        self.congestion.ssthresh()
    }

    /// Window most recently advertised by the peer.
    pub fn peer_window(&self) -> u32 {
        self.sender.peer_window()
    }

    /// Data bytes sent and not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.sender.in_flight()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The datagram channel this connection sends through.
    pub fn channel(&self) -> &C {
        self.link.channel()
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Queue as much of `data` as the send window allows.
    ///
    /// Blocks only while the usable window `min(peer_window, cwnd) - in_flight`
    /// is zero.  Returns the number of bytes accepted, which is at least one
    /// for non-empty input; retry with the remainder (or use [`send_all`]).
    ///
    /// [`send_all`]: Connection::send_all
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        if !self.state.can_send() {
            return Err(ConnError::NotConnected(self.state));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        while sent < data.len() {
            let len = self
                .sender
                .next_segment_len(data.len() - sent, self.congestion.cwnd());
            if len == 0 {
                if sent > 0 {
                    break;
                }
                self.step(true).await?;
                if !self.state.can_send() {
                    return Err(ConnError::NotConnected(self.state));
                }
                continue;
            }

            self.persist_at = None;
            let pkt = self.sender.build_data_packet(
                data[sent..sent + len].to_vec(),
                self.receiver.ack_number(),
                self.receiver.window_size(),
            );
            if !self.sender.has_unacked() {
                self.last_progress = Instant::now();
            }
            self.transmit(&pkt).await?;
            log::debug!(
                "[conn] → DATA seq={} len={} in_flight={} cwnd={}",
                pkt.header.seq,
                len,
                self.sender.in_flight() as usize + len,
                self.congestion.cwnd()
            );
            self.sender.record_sent(pkt, Instant::now());
            sent += len;
        }
        Ok(sent)
    }

    /// Send every byte of `data`, blocking on the window as often as needed.
    pub async fn send_all(&mut self, mut data: &[u8]) -> Result<(), ConnError> {
        while !data.is_empty() {
            let n = self.send(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Wait until every in-flight byte has been acknowledged.
    pub async fn flush(&mut self) -> Result<(), ConnError> {
        while self.sender.has_unacked() && self.state != ConnectionState::Closed {
            self.step(false).await?;
        }
        Ok(())
    }

    /// Read received bytes into `buf`.
    ///
    /// Returns buffered in-order data first; otherwise blocks until the peer
    /// delivers some.  `Ok(0)` means end of stream: the peer's FIN has been
    /// consumed and nothing is left to read, even after teardown finished.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        loop {
            if !self.receiver.is_empty() {
                let n = self.receiver.read(buf);
                self.maybe_send_window_update().await?;
                return Ok(n);
            }
            if self.receiver.fin_received() {
                return Ok(0);
            }
            if !self.state.can_recv() {
                return Err(ConnError::NotConnected(self.state));
            }
            if buf.is_empty() {
                return Ok(0);
            }
            self.step(false).await?;
        }
    }

    // -----------------------------------------------------------------------
    // Receive primitive
    // -----------------------------------------------------------------------

    /// Wait for the next well-formed segment accepted by `matches`.
    ///
    /// Corrupted datagrams and segments rejected by `matches` are discarded.
    /// Returns `Ok(None)` once `deadline` passes; `None` waits forever.
    pub(crate) async fn try_receive_matching<F>(
        &mut self,
        mut matches: F,
        deadline: Option<Instant>,
    ) -> Result<Option<(Packet, SocketAddr)>, ConnError>
    where
        F: FnMut(&Packet, SocketAddr) -> bool,
    {
        loop {
            let recv = self.link.recv_from(&mut self.rx_buf);
            let (n, from) = match deadline {
                Some(deadline) => match timeout_at(deadline, recv).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(None),
                },
                None => recv.await?,
            };

            match Packet::decode(&self.rx_buf[..n]) {
                Ok(pkt) if matches(&pkt, from) => {
                    self.stats.record_received(pkt.payload.len());
                    return Ok(Some((pkt, from)));
                }
                Ok(pkt) => {
                    log::trace!(
                        "[conn] ignoring segment seq={} control={:#06x} from {from}",
                        pkt.header.seq,
                        pkt.header.control
                    );
                }
                Err(e) => log::debug!("[conn] dropping datagram from {from}: {e}"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Engine internals
    // -----------------------------------------------------------------------

    /// Encode and send `packet` to the peer.  Nothing leaves a closed connection.
    pub(crate) async fn transmit(&mut self, packet: &Packet) -> Result<(), ConnError> {
        let Some(peer) = self.peer else {
            return Err(ConnError::NotConnected(self.state));
        };
        if self.state == ConnectionState::Closed {
            log::trace!("[conn] closed; not sending seq={}", packet.header.seq);
            return Ok(());
        }
        self.link.send_to(&packet.encode(), peer).await?;
        self.stats.record_sent(packet.payload.len());
        self.last_window = packet.header.window;
        Ok(())
    }

    pub(crate) fn ack_packet(&self) -> Packet {
        Packet::new(
            self.sender.snd_nxt,
            self.receiver.ack_number(),
            flags::ACK,
            self.receiver.window_size(),
            Vec::new(),
        )
    }

    /// Send a pure cumulative ACK with the current window.
    pub(crate) async fn send_ack(&mut self) -> Result<(), ConnError> {
        let ack = self.ack_packet();
        log::trace!(
            "[conn] → ACK ack={} window={}",
            ack.header.ack,
            ack.header.window
        );
        self.transmit(&ack).await
    }

    /// Wait for one event: a segment from the peer or a retransmission
    /// deadline.  With `persist` set, a zero peer window arms the persist timer.
    pub(crate) async fn step(&mut self, persist: bool) -> Result<(), ConnError> {
        if persist && !self.sender.has_unacked() && self.persist_at.is_none() {
            self.persist_at = Some(Instant::now());
        }
        let Some(peer) = self.peer else {
            return Err(ConnError::NotConnected(self.state));
        };
        let deadline = self.retransmit_deadline();
        match self
            .try_receive_matching(|_, from| from == peer, deadline)
            .await?
        {
            Some((pkt, _)) => self.on_segment(pkt).await,
            None => self.on_timeout().await,
        }
    }

    fn retransmit_deadline(&self) -> Option<Instant> {
        let anchor = match self.sender.oldest_sent_at() {
            Some(sent_at) => Some(sent_at.max(self.last_progress)),
            None => self.persist_at,
        };
        anchor.map(|t| self.timer.deadline(t))
    }

    /// Dispatch one segment from the peer.
    pub(crate) async fn on_segment(&mut self, pkt: Packet) -> Result<(), ConnError> {
        let h = &pkt.header;

        if h.has(flags::SYN) {
            // A repeated SYN-ACK means our final handshake ACK was lost.
            if h.has(flags::ACK) && self.state != ConnectionState::SynSent {
                log::debug!("[handshake] ← duplicate SYN-ACK; → ACK");
                self.send_ack().await?;
            }
            return Ok(());
        }

        if self.persist_at.is_some() {
            // The peer is alive; keep probing at the base interval.
            self.timer.reset();
        }
        if h.has(flags::ACK) {
            // Only a segment carrying nothing else can be a duplicate ACK.
            let pure = pkt.payload.is_empty() && !h.has(flags::FIN);
            self.on_ack(h.ack, h.window, pure).await?;
            if self.sender.peer_window() > 0 {
                self.persist_at = None;
            }
        }

        let mut ack_now = false;
        if !pkt.payload.is_empty() {
            let delivered = self.receiver.on_segment(h.seq, &pkt.payload);
            log::debug!(
                "[conn] ← DATA seq={} len={} delivered={} rcv_nxt={}",
                h.seq,
                pkt.payload.len(),
                delivered,
                self.receiver.rcv_nxt
            );
            ack_now = true;
        }
        if h.has(flags::FIN) {
            let fin_seq = h.seq.wrapping_add(pkt.payload.len() as u32);
            self.on_peer_fin(fin_seq);
            ack_now = true;
        } else if pkt.payload.is_empty() && seq_lt(h.seq, self.receiver.rcv_nxt) {
            // Persist segment, or a stale one: answer with the current state.
            ack_now = true;
        }

        if ack_now {
            self.send_ack().await?;
        }
        Ok(())
    }

    async fn on_ack(&mut self, ack: u32, window: u16, pure: bool) -> Result<(), ConnError> {
        match self.sender.on_ack(ack, window, pure) {
            AckOutcome::Advanced { bytes } => {
                log::debug!(
                    "[conn] ← ACK ack={ack} window={window} acked={bytes} in_flight={}",
                    self.sender.in_flight()
                );
                if bytes > 0 {
                    self.congestion.on_ack();
                }
                self.timer.reset();
                self.last_progress = Instant::now();
            }
            AckOutcome::Duplicate => {
                log::trace!("[conn] ← duplicate ACK ack={ack}");
                if self.congestion.on_duplicate_ack() {
                    let now = Instant::now();
                    let ack_no = self.receiver.ack_number();
                    let wnd = self.receiver.window_size();
                    if let Some(pkt) = self.sender.retransmit_oldest(ack_no, wnd, now) {
                        log::debug!(
                            "[conn] fast retransmit seq={} len={}",
                            pkt.header.seq,
                            pkt.payload.len()
                        );
                        self.stats.record_lost(pkt.payload.len());
                        self.transmit(&pkt).await?;
                    }
                }
            }
            AckOutcome::Ignored => {}
        }
        Ok(())
    }

    /// The retransmission deadline passed.
    async fn on_timeout(&mut self) -> Result<(), ConnError> {
        let now = Instant::now();
        let ack = self.receiver.ack_number();
        let window = self.receiver.window_size();
        let exhausted = self.timer.backoffs() >= self.config.max_retries;

        if self.sender.has_unacked() {
            if exhausted {
                log::warn!(
                    "[conn] peer {:?} unreachable after {} retransmissions",
                    self.peer,
                    self.timer.backoffs()
                );
                self.enter_closed();
                return Err(ConnError::Channel(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer stopped acknowledging data",
                )));
            }
            self.congestion.on_timeout();
            self.timer.back_off();
            if let Some(pkt) = self.sender.retransmit_oldest(ack, window, now) {
                log::debug!(
                    "[conn] timeout; → DATA seq={} len={} rto={:?}",
                    pkt.header.seq,
                    pkt.payload.len(),
                    self.timer.rto()
                );
                self.stats.record_lost(pkt.payload.len());
                self.transmit(&pkt).await?;
            }
        } else if self.sender.fin().is_some() && !self.sender.fin_acked() {
            if exhausted {
                log::warn!("[teardown] FIN never acknowledged; closing");
                self.enter_closed();
                return Ok(());
            }
            self.timer.back_off();
            if let Some(pkt) = self.sender.retransmit_fin(ack, window, now) {
                log::debug!("[teardown] timeout; → FIN seq={}", pkt.header.seq);
                self.stats.record_lost(0);
                self.transmit(&pkt).await?;
            }
        } else if self.persist_at.is_some() {
            if exhausted {
                log::warn!("[conn] peer window stayed closed; giving up");
                self.enter_closed();
                return Err(ConnError::Channel(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "peer window never reopened",
                )));
            }
            self.timer.back_off();
            self.persist_at = Some(now);
            let persist = Packet::new(
                self.sender.snd_nxt.wrapping_sub(1),
                ack,
                flags::ACK,
                window,
                Vec::new(),
            );
            log::debug!("[conn] → persist seq={}", persist.header.seq);
            self.transmit(&persist).await?;
        }
        Ok(())
    }

    /// Tell the peer the window reopened once the application drained a
    /// buffer whose advertised window had fallen below one segment.
    async fn maybe_send_window_update(&mut self) -> Result<(), ConnError> {
        let mss = self.config.segment_size().min(self.receiver.capacity());
        let window = usize::from(self.receiver.window_size());
        if usize::from(self.last_window) < mss
            && window >= mss
            && self.peer.is_some()
            && self.state != ConnectionState::Closed
        {
            log::debug!("[conn] → window update window={window}");
            self.send_ack().await?;
        }
        Ok(())
    }

    /// Move to CLOSED; nothing is transmitted afterwards.
    pub(crate) fn enter_closed(&mut self) {
        if self.state != ConnectionState::Closed {
            log::info!("[conn] {:?} closed; {}", self.peer, self.stats);
        }
        self.state = ConnectionState::Closed;
        self.persist_at = None;
    }
}

impl<C: Channel> std::fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("snd_una", &self.sender.snd_una)
            .field("snd_nxt", &self.sender.snd_nxt)
            .field("rcv_nxt", &self.receiver.rcv_nxt)
            .field("cwnd", &self.congestion.cwnd())
            .field("ssthresh", &self.congestion.ssthresh())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> Connection {
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        Connection::open(socket, Config::default())
    }

    #[tokio::test]
    async fn new_connection_is_closed() {
        let conn = open().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.peer_addr().is_none());
        assert_eq!(conn.cwnd(), 4200);
        assert_eq!(conn.ssthresh(), 8192);
        assert_eq!(conn.stats(), Statistics::default());
    }

    #[tokio::test]
    async fn data_operations_require_an_open_connection() {
        let mut conn = open().await;
        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.send(b"x").await,
            Err(ConnError::NotConnected(ConnectionState::Closed))
        ));
        assert!(matches!(
            conn.recv(&mut buf).await,
            Err(ConnError::NotConnected(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn receive_matching_times_out_and_skips_garbage() {
        let mut conn = open().await;
        let other = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        other.send_to(b"not a segment", conn.local_addr()).await.unwrap();

        let deadline = Instant::now() + std::time::Duration::from_millis(100);
        let got = conn
            .try_receive_matching(|_, _| true, Some(deadline))
            .await
            .unwrap();
        assert!(got.is_none());
        assert_eq!(conn.stats().packets_received, 0);
    }

    #[tokio::test]
    async fn receive_matching_returns_first_accepted_segment() {
        let mut conn = open().await;
        let other = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let to = conn.local_addr();
        other
            .send_to(&Packet::new(1, 0, flags::FIN, 0, Vec::new()).encode(), to)
            .await
            .unwrap();
        other
            .send_to(&Packet::new(2, 0, flags::SYN, 0, Vec::new()).encode(), to)
            .await
            .unwrap();

        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        let (pkt, from) = conn
            .try_receive_matching(|p, _| p.header.has(flags::SYN), Some(deadline))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.header.seq, 2);
        assert_eq!(from, other.local_addr);
        assert_eq!(conn.stats().packets_received, 1);
    }
}
