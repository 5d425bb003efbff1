//! Network simulator for deterministic testing.
//!
//! Real networks drop, reorder, duplicate and corrupt packets.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] wraps any [`Channel`] and applies a configurable fault model
//! to every outgoing datagram:
//!
//! | Fault            | Description                                       |
//! |------------------|---------------------------------------------------|
//! | Packet loss      | Drop a datagram with probability `loss_rate`.     |
//! | Scripted loss    | Drop the next datagram matching a header predicate.|
//! | Reordering       | Hold a datagram back until the next one is sent.  |
//! | Duplication      | Deliver a datagram twice.                         |
//! | Corruption       | Flip one random byte.                             |
//!
//! The fault model is driven by a seeded RNG so failures are reproducible.
//! Received datagrams pass through untouched; wrap both endpoints to perturb
//! both directions.

use std::io;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::Header;
use crate::socket::Channel;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`; values outside it are
/// clamped.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram is held back behind the next one.
    pub reorder_rate: f64,
    /// Probability that a datagram is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that one byte of a datagram is flipped.
    pub corrupt_rate: f64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            seed: 0,
        }
    }
}

/// Counters of the faults injected so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub forwarded: u64,
    pub dropped: u64,
    pub reordered: u64,
    pub duplicated: u64,
    pub corrupted: u64,
}

type DropRule = Box<dyn FnMut(&Header) -> bool + Send>;

struct FaultState {
    rng: StdRng,
    drop_rules: Vec<DropRule>,
    held: Option<(Vec<u8>, SocketAddr)>,
    stats: SimulatorStats,
}

/// A fault-injecting wrapper around another channel.
pub struct Simulator<C> {
    inner: C,
    config: SimulatorConfig,
    state: Mutex<FaultState>,
}

impl<C: Channel> Simulator<C> {
    pub fn new(inner: C, config: SimulatorConfig) -> Self {
        let state = FaultState {
            rng: StdRng::seed_from_u64(config.seed),
            drop_rules: Vec::new(),
            held: None,
            stats: SimulatorStats::default(),
        };
        Self {
            inner,
            config,
            state: Mutex::new(state),
        }
    }

    /// A simulator that injects no faults until told to.
    pub fn pass_through(inner: C) -> Self {
        Self::new(inner, SimulatorConfig::default())
    }

    /// Drop the next outgoing datagram whose header satisfies `rule`.
    ///
    /// Rules are one-shot and checked in registration order.
    pub fn drop_once<F>(&self, rule: F)
    where
        F: FnMut(&Header) -> bool + Send + 'static,
    {
        self.lock().drop_rules.push(Box::new(rule));
    }

    /// Number of scripted drops not yet triggered.
    pub fn pending_drops(&self) -> usize {
        self.lock().drop_rules.len()
    }

    pub fn stats(&self) -> SimulatorStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide the fate of one outgoing datagram: the list of datagrams to
    /// actually put on the wire, in order.
    fn plan(&self, datagram: &[u8], dest: SocketAddr) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut out = Vec::with_capacity(3);

        let scripted = match Header::parse(datagram) {
            Some(header) => {
                let hit = state.drop_rules.iter_mut().position(|rule| rule(&header));
                hit.map(|i| state.drop_rules.remove(i)).is_some()
            }
            None => false,
        };

        if scripted || state.rng.random_bool(clamp(self.config.loss_rate)) {
            state.stats.dropped += 1;
            log::debug!("[sim] dropped {} bytes to {dest}", datagram.len());
        } else {
            let mut bytes = datagram.to_vec();
            if !bytes.is_empty() && state.rng.random_bool(clamp(self.config.corrupt_rate)) {
                let i = state.rng.random_range(0..bytes.len());
                bytes[i] ^= state.rng.random_range(1..=u8::MAX);
                state.stats.corrupted += 1;
                log::debug!("[sim] corrupted byte {i}");
            }

            if state.held.is_none() && state.rng.random_bool(clamp(self.config.reorder_rate)) {
                state.stats.reordered += 1;
                log::debug!("[sim] holding {} bytes back", bytes.len());
                state.held = Some((bytes, dest));
                return out;
            }

            if state.rng.random_bool(clamp(self.config.duplicate_rate)) {
                state.stats.duplicated += 1;
                out.push((bytes.clone(), dest));
            }
            out.push((bytes, dest));
        }

        // A held datagram goes out behind whatever was sent after it.
        if let Some(held) = state.held.take() {
            out.push(held);
        }
        state.stats.forwarded += out.len() as u64;
        out
    }
}

fn clamp(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl<C: Channel> Channel for Simulator<C> {
    async fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> io::Result<usize> {
        for (bytes, to) in self.plan(datagram, dest) {
            self.inner.send_to(&bytes, to).await?;
        }
        Ok(datagram.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}
