//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions live with the protocol that drives them:
//! [`crate::handshake`] for the opening states and [`crate::teardown`] for
//! the closing ones.
//!
//! ```text
//!  CLOSED ──send SYN──▶ SYN_SENT ──recv SYN-ACK, send ACK──▶ ESTABLISHED   (client)
//!  CLOSED ──recv SYN, send SYN-ACK──▶ HANDSHAKE ──recv ACK──▶ ESTABLISHED  (server)
//!
//!  ESTABLISHED ──shutdown, send FIN──▶ CLOSING_BY_HOST ──ACK + peer FIN──▶ CLOSED
//!  ESTABLISHED ──recv FIN, send ACK──▶ CLOSING_BY_PEER ──shutdown, FIN ACKed──▶ CLOSED
//! ```

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection exists; initial and terminal state.
    #[default]
    Closed,
    /// SYN has been sent; waiting for SYN-ACK.
    SynSent,
    /// SYN received and SYN-ACK sent; waiting for the final ACK.
    Handshake,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local side sent FIN; waiting for its ACK and for the peer's FIN.
    ClosingByHost,
    /// Peer's FIN received and acknowledged; local FIN not yet acknowledged.
    ClosingByPeer,
}

impl ConnectionState {
    /// States in which the application may still queue outbound data.
    ///
    /// A peer that sent FIN still reads, so `ClosingByPeer` qualifies.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::ClosingByPeer)
    }

    /// States in which inbound data may still be buffered or arrive.
    pub fn can_recv(self) -> bool {
        matches!(
            self,
            Self::Established | Self::ClosingByHost | Self::ClosingByPeer
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::Handshake => "HANDSHAKE",
            Self::Established => "ESTABLISHED",
            Self::ClosingByHost => "CLOSING_BY_HOST",
            Self::ClosingByPeer => "CLOSING_BY_PEER",
        };
        f.write_str(name)
    }
}
