//! Integration tests for the 3-way handshake.
//!
//! Each test binds real `tokio::net::UdpSocket`s on loopback, runs the
//! server half in a background task, and checks both ends.  Lost segments
//! are scripted with `Simulator::drop_once`.

mod common;

use std::time::Duration;

use microtcp::packet::flags;
use microtcp::{ConnError, Connection, ConnectionState, Listener};
use rand::rngs::StdRng;
use rand::SeedableRng;

use common::{bind, clean, establish, fast_config, init_logging, STEP};

// ---------------------------------------------------------------------------
// Clean handshakes
// ---------------------------------------------------------------------------

/// Both sides should reach `Established` after a clean handshake on loopback.
#[tokio::test]
async fn both_sides_reach_established() {
    init_logging();
    let (client, server) = establish(bind().await, bind().await, fast_config()).await;

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.peer_addr(), Some(server.local_addr()));
    assert_eq!(server.peer_addr(), Some(client.local_addr()));
}

/// Each side expects exactly the next sequence number the other will send.
#[tokio::test]
async fn sequence_numbers_agree() {
    let (client, server) = establish(bind().await, bind().await, fast_config()).await;

    assert_eq!(client.local_ack(), server.local_sequence());
    assert_eq!(server.local_ack(), client.local_sequence());
    assert_eq!(client.stats().packets_lost, 0);
    assert_eq!(server.stats().packets_lost, 0);
}

/// Each side records the window the other advertised.
#[tokio::test]
async fn peer_windows_exchanged() {
    let (client, server) = establish(bind().await, bind().await, fast_config()).await;
    assert_eq!(client.peer_window(), 8192);
    assert_eq!(server.peer_window(), 8192);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// A peer that never answers exhausts the retry budget.
#[tokio::test]
async fn silent_peer_times_out() {
    let silent = bind().await;
    let config = microtcp::Config {
        handshake_timeout: Duration::from_millis(30),
        handshake_retries: 3,
        ..fast_config()
    };
    let mut conn = Connection::open(bind().await, config);
    let mut rng = StdRng::seed_from_u64(3);

    let err = tokio::time::timeout(STEP, conn.connect(silent.local_addr, &mut rng))
        .await
        .expect("connect hung")
        .unwrap_err();

    assert!(matches!(err, ConnError::HandshakeTimeout { attempts: 4 }));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.peer_addr(), None);
}

/// A second `connect` on an established connection is rejected untouched.
#[tokio::test]
async fn connect_twice_is_invalid() {
    let (mut client, server) = establish(bind().await, bind().await, fast_config()).await;
    let sent = client.stats().packets_sent;
    let mut rng = StdRng::seed_from_u64(9);

    let err = client
        .connect(server.local_addr(), &mut rng)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConnError::InvalidState(ConnectionState::Established)
    ));
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(client.stats().packets_sent, sent);
}

/// `shutdown` is a no-op on a closed connection and refused mid-handshake.
#[tokio::test]
async fn shutdown_during_handshake_is_invalid() {
    let mut conn = Connection::open(bind().await, fast_config());
    assert!(conn.shutdown().await.is_ok());
    assert_eq!(conn.stats().packets_sent, 0);

    // Abandon a connect to a silent peer while it waits for the SYN-ACK.
    let silent = bind().await;
    let mut rng = StdRng::seed_from_u64(2);
    let attempt = tokio::time::timeout(
        Duration::from_millis(20),
        conn.connect(silent.local_addr, &mut rng),
    )
    .await;
    assert!(attempt.is_err(), "connect should still be waiting");
    assert_eq!(conn.state(), ConnectionState::SynSent);

    assert!(matches!(
        conn.shutdown().await,
        Err(ConnError::InvalidState(ConnectionState::SynSent))
    ));
}

// ---------------------------------------------------------------------------
// Loss recovery
// ---------------------------------------------------------------------------

/// A lost SYN is retransmitted.
#[tokio::test]
async fn recovers_from_lost_syn() {
    let client = clean().await;
    client.drop_once(|h| h.has(flags::SYN) && !h.has(flags::ACK));

    let (client, server) = establish(client, bind().await, fast_config()).await;
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.stats().packets_lost, 1);
    assert_eq!(client.channel().stats().dropped, 1);
}

/// A lost SYN-ACK is retransmitted by the server.
#[tokio::test]
async fn recovers_from_lost_syn_ack() {
    let server = clean().await;
    server.drop_once(|h| h.has(flags::SYN | flags::ACK));

    let (client, server) = establish(bind().await, server, fast_config()).await;
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.local_ack(), server.local_sequence());
    assert_eq!(server.channel().pending_drops(), 0);
}

/// A lost final ACK: the client's first data segment completes the
/// server's handshake and its payload is delivered.
#[tokio::test]
async fn first_data_segment_stands_in_for_lost_ack() {
    let client = clean().await;
    client.drop_once(|h| h.has(flags::ACK) && !h.has(flags::SYN) && h.data_len == 0);

    let config = fast_config();
    let listener = Listener::new(bind().await, config.clone());
    let server_addr = listener.local_addr();
    let accept = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(11);
        let mut conn = listener.accept(&mut rng).await?;
        let mut buf = [0u8; 16];
        let n = conn.recv(&mut buf).await?;
        Ok::<_, ConnError>((conn, buf[..n].to_vec()))
    });

    let mut conn = Connection::open(client, config);
    let mut rng = StdRng::seed_from_u64(12);
    tokio::time::timeout(STEP, conn.connect(server_addr, &mut rng))
        .await
        .unwrap()
        .unwrap();
    conn.send_all(b"hi").await.unwrap();
    conn.flush().await.unwrap();

    let (server, got) = tokio::time::timeout(STEP, accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(got, b"hi");
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(conn.channel().stats().dropped, 1);
}

/// A lost final ACK with an idle client: the server's repeated SYN-ACK is
/// answered while the client waits for data.
#[tokio::test]
async fn idle_client_reacknowledges_repeated_syn_ack() {
    let client = clean().await;
    client.drop_once(|h| h.has(flags::ACK) && !h.has(flags::SYN) && h.data_len == 0);

    let config = fast_config();
    let listener = Listener::new(bind().await, config.clone());
    let server_addr = listener.local_addr();
    let accept = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(21);
        let mut conn = listener.accept(&mut rng).await?;
        conn.send_all(b"welcome").await?;
        conn.flush().await?;
        Ok::<_, ConnError>(conn)
    });

    let mut conn = Connection::open(client, config);
    let mut rng = StdRng::seed_from_u64(22);
    tokio::time::timeout(STEP, conn.connect(server_addr, &mut rng))
        .await
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(STEP, conn.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"welcome");

    let server = tokio::time::timeout(STEP, accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.state(), ConnectionState::Established);
    assert!(server.stats().packets_lost >= 1);
}

/// Listener survives a half-open attempt that never completes.
#[tokio::test]
async fn listener_drops_abandoned_half_open() {
    let config = microtcp::Config {
        handshake_timeout: Duration::from_millis(20),
        handshake_retries: 1,
        ..fast_config()
    };
    let listener = Listener::new(bind().await, config.clone());
    let server_addr = listener.local_addr();
    let accept = tokio::spawn(async move {
        let mut rng = StdRng::seed_from_u64(31);
        listener.accept(&mut rng).await
    });

    // A raw SYN from a peer that will never answer the SYN-ACK.
    let ghost = bind().await;
    let syn = microtcp::packet::Packet::new(1000, 0, flags::SYN, 8192, Vec::new()).encode();
    microtcp::Channel::send_to(&ghost, &syn, server_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut conn = Connection::open(bind().await, fast_config());
    let mut rng = StdRng::seed_from_u64(32);
    tokio::time::timeout(STEP, conn.connect(server_addr, &mut rng))
        .await
        .unwrap()
        .unwrap();
    let server = tokio::time::timeout(STEP, accept)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(server.peer_addr(), Some(conn.local_addr()));
}

/// Simulated wrappers are usable as the listener's channel too.
#[tokio::test]
async fn handshake_over_simulators() {
    let (client, server) = establish(clean().await, clean().await, fast_config()).await;
    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert!(client.channel().stats().forwarded >= 2);
    assert_eq!(server.channel().stats().dropped, 0);
}
