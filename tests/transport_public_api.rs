//! Integration tests for the transport public API.
//!
//! These exercise the public facade end to end over loopback: address
//! validation, identity-pinned dialing, stream transfer, and gating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use multiaddr::Multiaddr;
use tokio::time::timeout;

use burrow::{
    Connection, ConnectionGater, Direction, Keypair, PeerId, QuicTransport, TransportError,
    GATING_ERROR_CODE,
};

/// Allow time for handshakes on loaded CI machines.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn loopback_addr() -> Multiaddr {
    "/ip4/127.0.0.1/udp/0/quic".parse().unwrap()
}

fn transport() -> QuicTransport {
    init_tracing();
    QuicTransport::new(Keypair::generate(), None, None).expect("transport construction")
}

/// Run tests with `RUST_LOG=burrow=debug` to watch the handshakes.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn can_dial_accepts_exactly_quic_shapes() {
    let transport = transport();

    for addr in [
        "/ip4/1.2.3.4/udp/4001/quic",
        "/ip6/2001:db8::1/udp/4001/quic",
    ] {
        assert!(
            transport.can_dial(&addr.parse().unwrap()),
            "{addr} should be dialable"
        );
    }

    for addr in [
        "/dns4/example.com/udp/4001/quic",
        "/dns6/example.com/udp/4001/quic",
        "/dnsaddr/example.com/udp/4001/quic",
        "/ip4/1.2.3.4/udp/4001",
        "/ip4/1.2.3.4/tcp/4001",
    ] {
        assert!(
            !transport.can_dial(&addr.parse().unwrap()),
            "{addr} should be rejected"
        );
    }
}

#[test]
fn pre_shared_keys_are_a_configuration_error() {
    let err = QuicTransport::new(Keypair::generate(), Some(b"swarm key".as_slice()), None)
        .err()
        .expect("psk must be rejected");
    assert_eq!(
        err.downcast_ref::<TransportError>(),
        Some(&TransportError::PrivateNetworksUnsupported)
    );
}

#[tokio::test]
async fn listen_resolves_wildcard_port() {
    let transport = transport();
    let mut listener = transport.listen(&loopback_addr()).await.expect("listen");

    let addr = listener.local_addr();
    assert_eq!(addr.ip(), std::net::Ipv4Addr::LOCALHOST);
    assert!(addr.port() > 0, "OS must have assigned a concrete port");
    assert_eq!(
        listener.multiaddr().to_string(),
        format!("/ip4/127.0.0.1/udp/{}/quic", addr.port())
    );

    listener.close();
    transport.close().await.expect("close");
}

#[tokio::test]
async fn loopback_dial_authenticates_and_carries_streams() {
    let server = transport();
    let client = transport();
    let server_peer = server.local_peer();
    let client_peer = client.local_peer();

    let mut listener = server.listen(&loopback_addr()).await.expect("listen");
    let server_addr = listener.multiaddr().clone();

    let accept_task = tokio::spawn(async move {
        let conn = timeout(TEST_TIMEOUT, listener.accept())
            .await
            .expect("accept timed out")
            .expect("listener yielded no connection");
        let (mut send, mut recv) = conn.accept_bi().await.expect("accept stream");
        let mut buf = [0u8; 4];
        recv.read_exact(&mut buf).await.expect("read request");
        send.write_all(&buf).await.expect("echo");
        send.finish().expect("finish stream");
        (conn.remote_peer(), listener)
    });

    let conn = timeout(TEST_TIMEOUT, client.dial(&server_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    assert_eq!(conn.remote_peer(), server_peer);
    assert_eq!(
        PeerId::from_public_key(conn.remote_public_key()),
        server_peer
    );
    assert_eq!(conn.remote_multiaddr(), &server_addr);

    let (mut send, mut recv) = conn.open_bi().await.expect("open stream");
    send.write_all(b"ping").await.expect("write");
    send.finish().expect("finish");
    let mut buf = [0u8; 4];
    recv.read_exact(&mut buf).await.expect("read echo");
    assert_eq!(&buf, b"ping");

    let (seen_peer, mut listener) = accept_task.await.expect("accept task");
    assert_eq!(seen_peer, client_peer);

    listener.close();
    client.close().await.expect("client close");
    server.close().await.expect("server close");
}

#[tokio::test]
async fn dial_with_wrong_peer_id_fails_handshake() {
    let server = transport();
    let client = transport();

    let mut listener = server.listen(&loopback_addr()).await.expect("listen");
    let server_addr = listener.multiaddr().clone();

    // Pin the dial to an identity the server does not hold.
    let impostor = Keypair::generate().peer_id();
    let result = timeout(TEST_TIMEOUT, client.dial(&server_addr, impostor))
        .await
        .expect("dial timed out");
    assert!(result.is_err(), "handshake must fail on identity mismatch");

    listener.close();
    client.close().await.expect("client close");
    server.close().await.expect("server close");
}

struct DenyAll {
    rejected: AtomicUsize,
}

impl ConnectionGater for DenyAll {
    fn intercept_secured(&self, _direction: Direction, _peer: &PeerId, _conn: &Connection) -> bool {
        self.rejected.fetch_add(1, Ordering::SeqCst);
        false
    }
}

#[tokio::test]
async fn outbound_gating_rejects_after_handshake() {
    let server = transport();
    let gater = Arc::new(DenyAll {
        rejected: AtomicUsize::new(0),
    });
    let client = QuicTransport::new(
        Keypair::generate(),
        None,
        Some(Arc::clone(&gater) as Arc<dyn ConnectionGater>),
    )
    .expect("transport construction");

    let mut listener = server.listen(&loopback_addr()).await.expect("listen");
    let server_addr = listener.multiaddr().clone();

    let err = timeout(TEST_TIMEOUT, client.dial(&server_addr, server.local_peer()))
        .await
        .expect("dial timed out")
        .expect_err("gated dial must fail");
    assert_eq!(
        err.downcast_ref::<TransportError>(),
        Some(&TransportError::ConnectionGated)
    );
    assert_eq!(gater.rejected.load(Ordering::SeqCst), 1);

    listener.close();
    client.close().await.expect("client close");
    server.close().await.expect("server close");
}

#[tokio::test]
async fn inbound_gating_closes_with_gate_code() {
    let gater = Arc::new(DenyAll {
        rejected: AtomicUsize::new(0),
    });
    let server = QuicTransport::new(
        Keypair::generate(),
        None,
        Some(Arc::clone(&gater) as Arc<dyn ConnectionGater>),
    )
    .expect("transport construction");
    let client = transport();

    let mut listener = server.listen(&loopback_addr()).await.expect("listen");
    let server_addr = listener.multiaddr().clone();

    // The client side handshakes fine; the server gates afterwards and
    // closes with the GATE application code. The close may land before or
    // after the client's dial resolves.
    match timeout(TEST_TIMEOUT, client.dial(&server_addr, server.local_peer()))
        .await
        .expect("dial timed out")
    {
        Ok(conn) => {
            let reason = timeout(TEST_TIMEOUT, conn.closed())
                .await
                .expect("connection was not closed by the gater");
            match reason {
                quinn::ConnectionError::ApplicationClosed(close) => {
                    assert_eq!(close.error_code, quinn::VarInt::from_u32(GATING_ERROR_CODE));
                }
                other => panic!("expected application close, got {other}"),
            }
        }
        Err(_) => {
            // The GATE close raced the tail of the handshake.
        }
    }
    assert_eq!(gater.rejected.load(Ordering::SeqCst), 1);

    listener.close();
    client.close().await.expect("client close");
    server.close().await.expect("server close");
}
