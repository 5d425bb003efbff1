//! Three-way handshake.
//!
//! ```text
//!  Client (connect)                          Server (Listener::accept)
//!  CLOSED                                    waiting for SYN
//!    │ ── SYN seq=x ─────────────────────────▶ │
//!  SYN_SENT                                  HANDSHAKE
//!    │ ◀──────────── SYN|ACK seq=y ack=x+1 ── │
//!  ESTABLISHED                                 │
//!    │ ── ACK seq=x+1 ack=y+1 ───────────────▶ │
//!    │                                       ESTABLISHED
//! ```
//!
//! Both sides retransmit on `handshake_timeout`.  A lost final ACK is
//! covered two ways: the server accepts the client's first data segment in
//! its place, and an established client answers a repeated SYN-ACK with a
//! fresh ACK.

use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::{ConnError, Connection};
use crate::demux::{Endpoint, Link};
use crate::packet::{flags, Header, Packet};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::socket::{Channel, Socket, MAX_DATAGRAM};
use crate::state::ConnectionState;

impl<C: Channel> Connection<C> {
    /// Active open: perform the handshake with `peer`.
    ///
    /// The initial sequence number is drawn from `rng`.  On
    /// [`ConnError::HandshakeTimeout`] the connection is back in
    /// [`ConnectionState::Closed`] with no peer.
    pub async fn connect<R>(&mut self, peer: SocketAddr, rng: &mut R) -> Result<(), ConnError>
    where
        R: Rng + ?Sized,
    {
        if self.state != ConnectionState::Closed {
            return Err(ConnError::InvalidState(self.state));
        }

        let isn: u32 = rng.random();
        let expected_ack = isn.wrapping_add(1);
        let syn = Packet::new(isn, 0, flags::SYN, self.config.window(), Vec::new());

        self.peer = Some(peer);
        self.state = ConnectionState::SynSent;
        match self.active_open(&syn, peer, expected_ack).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ConnectionState::Closed;
                self.peer = None;
                Err(e)
            }
        }
    }

    async fn active_open(
        &mut self,
        syn: &Packet,
        peer: SocketAddr,
        expected_ack: u32,
    ) -> Result<(), ConnError> {
        let mut attempts = 1;
        log::debug!("[handshake] → SYN seq={} to {peer}", syn.header.seq);
        self.transmit(syn).await?;

        loop {
            let deadline = Instant::now() + self.config.handshake_timeout;
            let reply = self
                .try_receive_matching(
                    |p, from| {
                        from == peer
                            && p.header.has(flags::SYN | flags::ACK)
                            && p.header.ack == expected_ack
                    },
                    Some(deadline),
                )
                .await?;

            if let Some((synack, _)) = reply {
                let h = &synack.header;
                log::debug!("[handshake] ← SYN-ACK seq={} ack={}", h.seq, h.ack);
                self.sender = Sender::new(expected_ack, h.window, self.config.segment_size());
                self.receiver =
                    Receiver::new(h.seq.wrapping_add(1), self.config.recv_buffer_len);
                self.state = ConnectionState::Established;
                self.send_ack().await?;
                log::info!("[handshake] established with {peer}");
                return Ok(());
            }

            if attempts > self.config.handshake_retries {
                log::warn!("[handshake] no SYN-ACK from {peer} after {attempts} SYNs");
                return Err(ConnError::HandshakeTimeout { attempts });
            }
            attempts += 1;
            log::debug!("[handshake] timeout; → SYN seq={} (attempt {attempts})", syn.header.seq);
            self.stats.record_lost(0);
            self.transmit(syn).await?;
        }
    }

    /// Passive half of the handshake, started by `syn` from `from`.
    ///
    /// Returns `false` when the peer never completed it; the connection is
    /// then back in [`ConnectionState::Closed`].
    pub(crate) async fn passive_open<R>(
        &mut self,
        syn: &Header,
        from: SocketAddr,
        rng: &mut R,
    ) -> Result<bool, ConnError>
    where
        R: Rng + ?Sized,
    {
        let isn: u32 = rng.random();
        let expected_ack = isn.wrapping_add(1);

        self.peer = Some(from);
        self.state = ConnectionState::Handshake;
        self.receiver = Receiver::new(syn.seq.wrapping_add(1), self.config.recv_buffer_len);
        self.sender = Sender::new(expected_ack, syn.window, self.config.segment_size());

        let synack = Packet::new(
            isn,
            self.receiver.ack_number(),
            flags::SYN | flags::ACK,
            self.config.window(),
            Vec::new(),
        );
        log::debug!(
            "[handshake] ← SYN seq={} from {from}; → SYN-ACK seq={isn}",
            syn.seq
        );
        self.transmit(&synack).await?;

        let mut retries = 0;
        let mut deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let Some((pkt, _)) = self
                .try_receive_matching(|_, src| src == from, Some(deadline))
                .await?
            else {
                if retries >= self.config.handshake_retries {
                    log::warn!("[handshake] {from} never completed the handshake; dropping it");
                    self.state = ConnectionState::Closed;
                    self.peer = None;
                    return Ok(false);
                }
                retries += 1;
                log::debug!("[handshake] timeout; → SYN-ACK seq={isn} (retry {retries})");
                self.stats.record_lost(0);
                self.transmit(&synack).await?;
                deadline = Instant::now() + self.config.handshake_timeout;
                continue;
            };

            let h = &pkt.header;
            if h.has(flags::SYN) {
                if !h.has(flags::ACK) && h.seq == syn.seq {
                    log::debug!("[handshake] ← repeated SYN; → SYN-ACK seq={isn}");
                    self.stats.record_lost(0);
                    self.transmit(&synack).await?;
                }
                continue;
            }
            if h.has(flags::ACK) && h.ack == expected_ack {
                log::debug!(
                    "[handshake] ← ACK ack={} len={}",
                    h.ack,
                    pkt.payload.len()
                );
                self.state = ConnectionState::Established;
                log::info!("[handshake] established with {from}");
                // A data segment standing in for the final ACK is delivered.
                self.on_segment(pkt).await?;
                return Ok(true);
            }
            log::debug!("[handshake] discarding segment ack={} from {from}", h.ack);
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Passive endpoint that turns incoming SYNs into connections.
///
/// Accepted connections keep using the listener's channel through a
/// [`crate::demux`] endpoint claimed for their peer, so each one sees only
/// its own traffic and may be driven from any task, concurrently with
/// further calls to [`Listener::accept`].
pub struct Listener<C: Channel = Socket> {
    backlog: Endpoint<C>,
    config: Config,
}

impl<C: Channel> Listener<C> {
    pub fn new(channel: C, config: Config) -> Self {
        Self {
            backlog: Endpoint::backlog(channel),
            config,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.backlog.channel().local_addr()
    }

    /// The channel shared with every accepted connection.
    pub fn channel(&self) -> &C {
        self.backlog.channel()
    }

    /// Wait for a peer and complete the handshake with it.
    ///
    /// Half-open attempts that time out are dropped and the listener goes
    /// back to waiting; only channel errors are returned.
    pub async fn accept<R>(&self, rng: &mut R) -> Result<Connection<C>, ConnError>
    where
        R: Rng + ?Sized,
    {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.backlog.recv_from(&mut buf).await?;
            let syn = match Packet::decode(&buf[..n]) {
                Ok(pkt) if pkt.header.has(flags::SYN) && !pkt.header.has(flags::ACK) => pkt,
                Ok(pkt) => {
                    log::trace!(
                        "[handshake] listener ignoring seq={} control={:#06x} from {from}",
                        pkt.header.seq,
                        pkt.header.control
                    );
                    continue;
                }
                Err(e) => {
                    log::debug!("[handshake] dropping datagram from {from}: {e}");
                    continue;
                }
            };
            // A SYN queued before its peer was claimed belongs to that handshake.
            let Some(endpoint) = self.backlog.claim(from) else {
                log::debug!("[handshake] {from} already has a connection; ignoring SYN");
                continue;
            };

            let mut conn = Connection::with_link(Link::Routed(endpoint), self.config.clone());
            conn.stats.record_received(0);
            if conn.passive_open(&syn.header, from, &mut *rng).await? {
                return Ok(conn);
            }
        }
    }
}
