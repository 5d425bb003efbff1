//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use microtcp::timer::TimerConfig;
use microtcp::{Channel, Config, Connection, Listener, Simulator, SimulatorConfig, Socket};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Upper bound for any single test step.
pub const STEP: Duration = Duration::from_secs(20);

/// Short timers so loss recovery runs quickly on loopback.
pub fn fast_config() -> Config {
    Config {
        timer: TimerConfig {
            initial_rto: Duration::from_millis(40),
            max_rto: Duration::from_millis(400),
        },
        max_retries: 30,
        handshake_timeout: Duration::from_millis(80),
        handshake_retries: 10,
        time_wait: Duration::from_millis(100),
        fin_wait_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Bind a socket on an OS-chosen loopback port.
pub async fn bind() -> Socket {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Socket::bind(addr).await.expect("bind loopback socket")
}

pub async fn lossy(config: SimulatorConfig) -> Simulator<Socket> {
    Simulator::new(bind().await, config)
}

pub async fn clean() -> Simulator<Socket> {
    Simulator::pass_through(bind().await)
}

/// Run a handshake between `client` and `server` and return both ends.
pub async fn establish<A: Channel, B: Channel>(
    client: A,
    server: B,
    config: Config,
) -> (Connection<A>, Connection<B>) {
    let server_addr = server.local_addr();
    let listener = Listener::new(server, config.clone());
    let accept = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(0x5e77e7);
        listener.accept(&mut rng).await
    });

    let mut conn = Connection::open(client, config);
    let mut rng = StdRng::seed_from_u64(0xc11e47);
    tokio::time::timeout(STEP, conn.connect(server_addr, &mut rng))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let server = tokio::time::timeout(STEP, accept)
        .await
        .expect("accept timed out")
        .expect("accept task panicked")
        .expect("accept failed");
    (conn, server)
}

/// Read until end of stream.
pub async fn read_to_end<C: Channel>(conn: &mut Connection<C>) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let n = conn.recv(&mut buf).await.expect("recv failed");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Read exactly `len` bytes.
pub async fn read_exact<C: Channel>(conn: &mut Connection<C>, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 4096];
    while out.len() < len {
        let want = (len - out.len()).min(buf.len());
        let n = conn.recv(&mut buf[..want]).await.expect("recv failed");
        assert!(n > 0, "stream ended after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
