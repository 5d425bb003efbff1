//! Unreliable datagram channel abstraction.
//!
//! The protocol engine only needs three things from the network: send a
//! byte blob to an address, receive the next blob with its source, and know
//! its own address.  [`Channel`] captures exactly that; [`Socket`] is the
//! production implementation over `tokio::net::UdpSocket`, and
//! [`crate::simulator::Simulator`] wraps any channel with fault injection.
//!
//! Channels speak raw bytes.  Decoding, checksum verification and the
//! decision to discard a datagram belong to the connection layer.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
pub const MAX_DATAGRAM: usize = 65_535;

/// A connectionless datagram transport that may drop, duplicate or reorder.
///
/// All methods are `&self` so one channel can back a listener and the
/// connection it accepts.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Send `datagram` as a single unit to `dest`.
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize>;

    /// Receive the next datagram into `buf`; returns `(len, source)`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Address this channel is bound to.
    fn local_addr(&self) -> SocketAddr;
}

/// An async UDP socket.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: UdpSocket,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }
}

#[async_trait]
impl Channel for Socket {
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(datagram, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_datagram_roundtrip() {
        let a = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(a.local_addr.port(), 0);

        a.send_to(b"ping", b.local_addr).await.unwrap();
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr);
    }
}
