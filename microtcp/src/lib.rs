//! `microtcp`: a reliable, ordered, flow- and congestion-controlled byte
//! stream implemented over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────┐   segments   ┌──────────┐
//!  │  Sender  │─────────────▶│ Receiver │   (on the peer)
//!  └────┬─────┘              └─────┬────┘
//!       │        ACKs              │
//!       │◀─────────────────────────┘
//!       │
//!  ┌────▼──────────────────────────────┐
//!  │           Connection              │
//!  │  handshake · data · teardown      │
//!  │  congestion control · RTO timer   │
//!  └────┬──────────────────────────────┘
//!       │ raw datagrams
//!  ┌────▼──────────────┐
//!  │  Channel          │  Socket (tokio UdpSocket) or Simulator<C>
//!  └───────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      : wire format and CRC-32 checksum
//! - [`seq`]         : wrapping sequence-number comparisons
//! - [`state`]       : connection states
//! - [`sender`]      : send-side sliding window
//! - [`receiver`]    : reassembly, app buffer, advertised window
//! - [`congestion`]  : slow start / congestion avoidance
//! - [`timer`]       : retransmission timeout with back-off
//! - [`stats`]       : per-connection counters
//! - [`config`]      : tunables and their defaults
//! - [`connection`]  : the protocol engine and data-transfer API
//! - [`handshake`]   : active open and [`Listener`]
//! - [`teardown`]    : FIN exchange
//! - [`socket`]      : the [`Channel`] abstraction over UDP
//! - [`demux`]       : per-peer routing of a listener's shared channel
//! - [`simulator`]   : fault injection for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use microtcp::{Config, Connection, Socket};
//! use rand::SeedableRng;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let socket = Socket::bind("0.0.0.0:0".parse()?).await?;
//! let mut conn = Connection::open(socket, Config::default());
//! let mut rng = rand::rngs::StdRng::from_os_rng();
//! conn.connect("127.0.0.1:9000".parse()?, &mut rng).await?;
//! conn.send_all(b"Hello Server!").await?;
//! conn.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod congestion;
pub mod connection;
pub mod demux;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;
pub mod teardown;
pub mod timer;

pub use config::Config;
pub use connection::{ConnError, Connection};
pub use handshake::Listener;
pub use simulator::{Simulator, SimulatorConfig};
pub use socket::{Channel, Socket};
pub use state::ConnectionState;
pub use stats::Statistics;
pub use teardown::Role;
