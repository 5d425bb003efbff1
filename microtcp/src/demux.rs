//! Per-peer demultiplexing of one bound channel.
//!
//! A [`Listener`](crate::handshake::Listener) and every connection it accepts
//! share the listener's channel.  Each of them reads through its own
//! [`Endpoint`], which owns a bounded queue.  Whichever endpoint is waiting
//! takes the channel's read lock, receives one datagram and files it under
//! its source address: the queue of the connection claimed for that peer,
//! or else the listener's backlog.  A connection therefore only ever sees
//! its own peer's traffic, and two connections (or a connection and a
//! pending `accept`) can be driven from different tasks at once.
//!
//! There is no pump task.  A full or abandoned queue drops the datagram,
//! which the protocol treats like any other loss.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::socket::{Channel, MAX_DATAGRAM};

/// Datagrams held per endpoint before further ones are dropped.
pub const QUEUE_DEPTH: usize = 64;

type Datagram = (Vec<u8>, SocketAddr);
type Routes = HashMap<SocketAddr, mpsc::Sender<Datagram>>;

struct Demux<C> {
    channel: C,
    /// Scratch buffer, held by the endpoint currently reading `channel`.
    reader: AsyncMutex<Vec<u8>>,
    routes: Mutex<Routes>,
    backlog: mpsc::Sender<Datagram>,
}

impl<C: Channel> Demux<C> {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, datagram: Vec<u8>, from: SocketAddr) {
        let routes = self.routes();
        let queue = routes.get(&from).unwrap_or(&self.backlog);
        if queue.try_send((datagram, from)).is_err() {
            log::trace!("[demux] no room for a datagram from {from}; dropping it");
        }
    }
}

/// One reader of a shared channel: the listener's backlog, or a single peer.
pub struct Endpoint<C> {
    demux: Arc<Demux<C>>,
    peer: Option<SocketAddr>,
    queue: AsyncMutex<mpsc::Receiver<Datagram>>,
}

enum Wake<'a> {
    Filed(Option<Datagram>),
    Reader(AsyncMutexGuard<'a, Vec<u8>>),
}

impl<C: Channel> Endpoint<C> {
    /// Share `channel`.  The returned endpoint is the backlog: it receives
    /// datagrams from every address nobody has claimed.
    pub fn backlog(channel: C) -> Self {
        let (backlog, queue) = mpsc::channel(QUEUE_DEPTH);
        let demux = Demux {
            channel,
            reader: AsyncMutex::new(vec![0u8; MAX_DATAGRAM]),
            routes: Mutex::new(HashMap::new()),
            backlog,
        };
        Self {
            demux: Arc::new(demux),
            peer: None,
            queue: AsyncMutex::new(queue),
        }
    }

    /// A new endpoint receiving everything `peer` sends from now on.
    ///
    /// `None` while another endpoint still holds `peer`.  Dropping the
    /// endpoint releases the claim.
    pub fn claim(&self, peer: SocketAddr) -> Option<Self> {
        let mut routes = self.demux.routes();
        if routes.get(&peer).is_some_and(|tx| !tx.is_closed()) {
            return None;
        }
        let (tx, queue) = mpsc::channel(QUEUE_DEPTH);
        routes.insert(peer, tx);
        Some(Self {
            demux: Arc::clone(&self.demux),
            peer: Some(peer),
            queue: AsyncMutex::new(queue),
        })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The shared channel underneath.
    pub fn channel(&self) -> &C {
        &self.demux.channel
    }

    pub async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        self.demux.channel.send_to(datagram, dest).await
    }

    /// Next datagram for this endpoint; longer ones are truncated to `buf`.
    ///
    /// Cancel-safe: a datagram is either returned or left in a queue.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut queue = self.queue.lock().await;
        loop {
            let wake = tokio::select! {
                biased;
                filed = queue.recv() => Wake::Filed(filed),
                reader = self.demux.reader.lock() => Wake::Reader(reader),
            };
            let (datagram, from) = match wake {
                Wake::Filed(Some(filed)) => filed,
                Wake::Filed(None) => {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "shared channel is gone",
                    ));
                }
                Wake::Reader(mut scratch) => match queue.try_recv() {
                    // Filed for us while we waited for the lock.
                    Ok(filed) => filed,
                    Err(_) => {
                        let (n, from) = self.demux.channel.recv_from(&mut scratch).await?;
                        self.demux.file(scratch[..n].to_vec(), from);
                        continue;
                    }
                },
            };
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            return Ok((n, from));
        }
    }
}

impl<C> Drop for Endpoint<C> {
    fn drop(&mut self) {
        if let Some(peer) = self.peer {
            self.demux
                .routes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&peer);
        }
    }
}

/// How a connection reaches the network.
pub(crate) enum Link<C> {
    /// A channel owned by this connection alone.
    Direct(C),
    /// A claimed share of a listener's channel.
    Routed(Endpoint<C>),
}

impl<C: Channel> Link<C> {
    pub(crate) fn channel(&self) -> &C {
        match self {
            Self::Direct(channel) => channel,
            Self::Routed(endpoint) => endpoint.channel(),
        }
    }

    pub(crate) async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        match self {
            Self::Direct(channel) => channel.send_to(datagram, dest).await,
            Self::Routed(endpoint) => endpoint.send_to(datagram, dest).await,
        }
    }

    pub(crate) async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self {
            Self::Direct(channel) => channel.recv_from(buf).await,
            Self::Routed(endpoint) => endpoint.recv_from(buf).await,
        }
    }
}
