//! Entry point for the `microtcp` demo.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode.  The pair replays the classic exchange: the client sends a greeting,
//! the server answers, and both sides shut down and print their statistics.
//! All protocol work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing, optional fault injection).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use microtcp::{Channel, Config, Connection, Listener, Simulator, SimulatorConfig, Socket};

/// Reliable, congestion-controlled byte stream over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    net: NetOpts,
}

#[derive(Subcommand)]
enum Mode {
    /// Run as a server, answering one client.
    Server {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: SocketAddr,
        /// Reply sent after the client's message arrives.
        #[arg(short, long, default_value = "Hello Client!")]
        reply: String,
    },
    /// Run as a client, connecting to a remote server.
    Client {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: SocketAddr,
        /// Message sent once the connection is established.
        #[arg(short, long, default_value = "Hello Server!")]
        message: String,
    },
}

#[derive(Args)]
struct NetOpts {
    /// Probability of dropping an outgoing datagram.
    #[arg(long, global = true, default_value_t = 0.0)]
    loss_rate: f64,
    /// Probability of duplicating an outgoing datagram.
    #[arg(long, global = true, default_value_t = 0.0)]
    duplicate_rate: f64,
    /// Seed for the fault model.
    #[arg(long, global = true, default_value_t = 0)]
    seed: u64,
    /// Initial retransmission timeout in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    rto_ms: u64,
}

impl NetOpts {
    fn simulated(&self) -> bool {
        self.loss_rate > 0.0 || self.duplicate_rate > 0.0
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.timer.initial_rto = Duration::from_millis(self.rto_ms);
        config
    }

    fn simulator(&self, socket: Socket) -> Simulator<Socket> {
        Simulator::new(
            socket,
            SimulatorConfig {
                loss_rate: self.loss_rate,
                duplicate_rate: self.duplicate_rate,
                seed: self.seed,
                ..SimulatorConfig::default()
            },
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.net.config();

    match cli.mode {
        Mode::Server { bind, reply } => {
            log::info!("Starting server on {bind}");
            let socket = Socket::bind(bind)
                .await
                .with_context(|| format!("binding {bind}"))?;
            if cli.net.simulated() {
                serve(cli.net.simulator(socket), config, reply.as_bytes()).await
            } else {
                serve(socket, config, reply.as_bytes()).await
            }
        }
        Mode::Client { server, message } => {
            log::info!("Starting client, connecting to {server}");
            let any: SocketAddr = if server.is_ipv4() {
                "0.0.0.0:0".parse()?
            } else {
                "[::]:0".parse()?
            };
            let socket = Socket::bind(any).await.context("binding client socket")?;
            if cli.net.simulated() {
                greet(cli.net.simulator(socket), config, server, message.as_bytes()).await
            } else {
                greet(socket, config, server, message.as_bytes()).await
            }
        }
    }
}

async fn serve<C: Channel>(channel: C, config: Config, reply: &[u8]) -> Result<()> {
    let listener = Listener::new(channel, config);
    let mut rng = StdRng::from_os_rng();
    let mut conn = listener.accept(&mut rng).await.context("accept failed")?;
    println!("accepted {:?}", conn.peer_addr());

    let mut buf = vec![0u8; 4096];
    let n = conn.recv(&mut buf).await.context("waiting for message")?;
    println!("received: {}", String::from_utf8_lossy(&buf[..n]));

    conn.send_all(reply).await.context("sending reply")?;
    conn.shutdown().await.context("shutdown")?;
    println!("{}", conn.stats());
    Ok(())
}

async fn greet<C: Channel>(
    channel: C,
    config: Config,
    server: SocketAddr,
    message: &[u8],
) -> Result<()> {
    let mut conn = Connection::open(channel, config);
    let mut rng = StdRng::from_os_rng();
    conn.connect(server, &mut rng)
        .await
        .with_context(|| format!("connecting to {server}"))?;

    conn.send_all(message).await.context("sending message")?;
    let mut buf = vec![0u8; 4096];
    let n = conn.recv(&mut buf).await.context("waiting for reply")?;
    if n == 0 {
        bail!("server closed without replying");
    }
    println!("received: {}", String::from_utf8_lossy(&buf[..n]));

    conn.shutdown().await.context("shutdown")?;
    println!("{}", conn.stats());
    Ok(())
}
