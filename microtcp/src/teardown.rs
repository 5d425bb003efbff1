//! Four-way connection teardown.
//!
//! One state machine serves both ends; [`Role`] records which side sent the
//! first FIN.
//!
//! ```text
//!  Initiator                              Responder
//!  ESTABLISHED                            ESTABLISHED
//!      │ ── FIN|ACK ───────────────────────▶ │  CLOSING_BY_PEER
//!  CLOSING_BY_HOST ◀────────────── ACK ──── │
//!      │                                     │  (may keep sending data)
//!      │ ◀─────────────────────── FIN|ACK ── │  shutdown()
//!      │ ── ACK ──────────────────────────▶ │  CLOSED
//!  linger for time_wait, re-ACK FINs
//!  CLOSED
//! ```
//!
//! When both ends call [`Connection::shutdown`] at once each behaves as an
//! initiator: both FINs cross, each is acknowledged, and both linger.

use tokio::time::Instant;

use crate::connection::{ConnError, Connection};
use crate::receiver::FinOutcome;
use crate::socket::Channel;
use crate::state::ConnectionState;

/// Which side of the teardown this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent its FIN before seeing one from the peer.
    Initiator,
    /// Saw the peer's FIN first.
    Responder,
}

impl Role {
    /// The role implied by the state `shutdown` was called in, if any.
    pub fn for_state(state: ConnectionState) -> Option<Self> {
        match state {
            ConnectionState::Established | ConnectionState::ClosingByHost => Some(Self::Initiator),
            ConnectionState::ClosingByPeer => Some(Self::Responder),
            _ => None,
        }
    }
}

impl<C: Channel> Connection<C> {
    /// Gracefully close the connection.
    ///
    /// Flushes in-flight data, sends a FIN and waits for the exchange to
    /// complete.  A no-op on a closed connection; fails with
    /// [`ConnError::InvalidState`] while a handshake is in progress.
    pub async fn shutdown(&mut self) -> Result<(), ConnError> {
        match self.state {
            ConnectionState::Closed => return Ok(()),
            ConnectionState::SynSent | ConnectionState::Handshake => {
                return Err(ConnError::InvalidState(self.state));
            }
            _ => {}
        }

        self.flush().await?;
        // The peer's FIN may have arrived while flushing.
        let Some(role) = Role::for_state(self.state) else {
            return Ok(());
        };

        if self.sender.fin().is_none() {
            let fin = self
                .sender
                .build_fin(self.receiver.ack_number(), self.receiver.window_size());
            log::debug!(
                "[teardown] → FIN seq={} as {role:?}",
                fin.header.seq
            );
            self.transmit(&fin).await?;
            self.sender.record_fin(Instant::now());
            if self.state == ConnectionState::Established {
                self.state = ConnectionState::ClosingByHost;
            }
        }

        while !self.teardown_complete(role) {
            if self.state == ConnectionState::Closed {
                return Ok(());
            }
            if self.sender.fin_acked() {
                // Only the peer's FIN is missing and nothing of ours is in flight.
                if !self.await_peer_fin().await? {
                    self.enter_closed();
                    return Ok(());
                }
                continue;
            }
            self.step(false).await?;
        }

        if role == Role::Initiator {
            self.time_wait().await?;
        }
        self.enter_closed();
        Ok(())
    }

    fn teardown_complete(&self, role: Role) -> bool {
        match role {
            Role::Initiator => self.sender.fin_acked() && self.receiver.fin_received(),
            Role::Responder => self.sender.fin_acked(),
        }
    }

    /// Consume a FIN from the peer.  The caller acknowledges it.
    pub(crate) fn on_peer_fin(&mut self, fin_seq: u32) {
        match self.receiver.on_fin(fin_seq) {
            FinOutcome::Accepted => {
                log::debug!(
                    "[teardown] ← FIN seq={fin_seq} in {}; rcv_nxt={}",
                    self.state,
                    self.receiver.rcv_nxt
                );
                if self.state == ConnectionState::Established {
                    self.state = ConnectionState::ClosingByPeer;
                }
            }
            FinOutcome::Duplicate => log::debug!("[teardown] ← duplicate FIN seq={fin_seq}"),
            FinOutcome::OutOfOrder => {
                log::debug!(
                    "[teardown] ← FIN seq={fin_seq} ahead of rcv_nxt={}",
                    self.receiver.rcv_nxt
                );
            }
        }
    }

    /// Wait for one segment from the peer after our FIN was acknowledged.
    ///
    /// `false` once the peer has stayed silent for `fin_wait_timeout`.
    async fn await_peer_fin(&mut self) -> Result<bool, ConnError> {
        let Some(peer) = self.peer else {
            return Ok(false);
        };
        let deadline = Instant::now() + self.config.fin_wait_timeout;
        match self
            .try_receive_matching(|_, from| from == peer, Some(deadline))
            .await?
        {
            Some((pkt, _)) => {
                self.on_segment(pkt).await?;
                Ok(true)
            }
            None => {
                log::warn!(
                    "[teardown] no FIN from {peer} within {:?}; closing",
                    self.config.fin_wait_timeout
                );
                Ok(false)
            }
        }
    }

    /// Linger so a lost final ACK can be repeated when the peer resends its FIN.
    async fn time_wait(&mut self) -> Result<(), ConnError> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.time_wait;
        while let Some((pkt, _)) = self
            .try_receive_matching(|_, from| from == peer, Some(deadline))
            .await?
        {
            self.on_segment(pkt).await?;
        }
        Ok(())
    }
}
