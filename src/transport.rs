//! # QUIC Transport Facade
//!
//! [`QuicTransport`] ties the pieces together: it validates multiaddresses,
//! derives per-peer TLS configurations from the identity layer, acquires
//! sockets through the [`ConnManager`], and asks the QUIC engine to run
//! handshakes over them. Every socket acquired for a dial is released by a
//! watcher once the resulting session terminates; every socket acquired for
//! a listener is released when the listener closes.
//!
//! ## Hole punching
//!
//! A dial carrying the simultaneous-connect hint with the server role does
//! not handshake at all. Instead it sprays random UDP packets toward the
//! remote endpoint on a randomized, widening schedule, while the regular
//! accept path races to deliver a matching inbound session through the
//! [`PunchTable`]. Whichever of delivery, the 5 second deadline, or
//! cancellation wins decides the outcome.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use multiaddr::{Multiaddr, Protocol};
use rand::{Rng, RngCore};
use tracing::{debug, trace};

use crate::crypto::{self, peer_id_to_sni, QuicParams, TlsIdentity};
use crate::identity::{Keypair, PeerId};
use crate::listener::Listener;
use crate::manager::{ConnManager, Network};
use crate::punch::{PunchKey, PunchTable};
use crate::reuse::ReuseConfig;
use crate::socket::TransportSocket;

/// Total budget for one hole-punch attempt.
pub const HOLE_PUNCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Application error code sent when a connection is rejected by the gater.
/// "GATE" in ASCII.
pub const GATING_ERROR_CODE: u32 = 0x4741_5445;

/// Size of a hole-punch payload.
const HOLE_PUNCH_PAYLOAD_LEN: usize = 64;

/// Queue depth for inbound connections awaiting `Listener::accept`.
pub(crate) const INCOMING_QUEUE: usize = 32;

/// Errors callers are expected to match on. Everything else surfaces as a
/// contextual [`anyhow::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The network token was neither `udp4` nor `udp6`.
    InvalidNetwork(String),
    /// A pre-shared key was supplied; QUIC has no private-network mode.
    PrivateNetworksUnsupported,
    /// A hole punch toward this address is already in flight.
    AlreadyHolePunching(SocketAddr),
    /// No matching inbound session arrived within the punch deadline.
    HolePunchTimeout,
    /// The connection gater rejected the secured connection.
    ConnectionGated,
    /// The identity layer failed to deliver the verified remote key after a
    /// successful handshake.
    MissingRemoteKey,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::InvalidNetwork(got) => {
                write!(f, "invalid network {got:?}: must be either udp4 or udp6")
            }
            TransportError::PrivateNetworksUnsupported => {
                write!(f, "QUIC doesn't support private networks yet")
            }
            TransportError::AlreadyHolePunching(addr) => {
                write!(f, "already punching hole for {addr}")
            }
            TransportError::HolePunchTimeout => write!(f, "hole punching timed out"),
            TransportError::ConnectionGated => write!(f, "secured connection gated"),
            TransportError::MissingRemoteKey => {
                write!(f, "expected remote public key to be set")
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Direction of a connection, as seen by the gater.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Admission policy for secured connections. Runs after the TLS handshake
/// has authenticated the remote peer.
pub trait ConnectionGater: Send + Sync {
    /// Return `false` to reject the connection; it is then closed with
    /// [`GATING_ERROR_CODE`].
    fn intercept_secured(&self, direction: Direction, peer: &PeerId, conn: &Connection) -> bool;
}

/// The QUIC engine collaborator: runs handshakes and wraps listeners over
/// sockets the transport supplies. Swappable in tests.
#[async_trait]
pub trait QuicEngine: Send + Sync + 'static {
    /// Establish a client session to `remote` over `socket`.
    async fn connect(
        &self,
        socket: TransportSocket,
        remote: SocketAddr,
        server_name: &str,
        tls: rustls::ClientConfig,
        params: &QuicParams,
    ) -> Result<quinn::Connection>;

    /// Start accepting sessions on `socket`.
    fn listen(
        &self,
        socket: TransportSocket,
        tls: rustls::ServerConfig,
        params: &QuicParams,
    ) -> Result<quinn::Endpoint>;
}

/// Default engine backed by quinn. One quinn endpoint is created per socket
/// and shared by the dialing and listening roles, so a dial out of a
/// listening socket rides the listener's endpoint instead of fighting it
/// for packets.
pub struct QuinnEngine;

impl QuinnEngine {
    fn endpoint_for(socket: &TransportSocket, params: &QuicParams) -> Result<quinn::Endpoint> {
        let io = socket.io();
        let config = crypto::endpoint_config(params);
        io.endpoint_or_init(|| {
            let runtime = quinn::default_runtime()
                .ok_or_else(|| anyhow::anyhow!("no async runtime found"))?;
            let endpoint = quinn::Endpoint::new_with_abstract_socket(
                config,
                None,
                io.clone(),
                runtime,
            )
            .context("failed to create QUIC endpoint")?;
            Ok(endpoint)
        })
    }
}

#[async_trait]
impl QuicEngine for QuinnEngine {
    async fn connect(
        &self,
        socket: TransportSocket,
        remote: SocketAddr,
        server_name: &str,
        tls: rustls::ClientConfig,
        params: &QuicParams,
    ) -> Result<quinn::Connection> {
        let endpoint = Self::endpoint_for(&socket, params)?;
        let client_config = crypto::client_quic_config(tls, params)?;
        let session = endpoint
            .connect_with(client_config, remote, server_name)
            .with_context(|| format!("failed to initiate connection to {remote}"))?
            .await
            .with_context(|| format!("failed to establish connection to {remote}"))?;
        Ok(session)
    }

    fn listen(
        &self,
        socket: TransportSocket,
        tls: rustls::ServerConfig,
        params: &QuicParams,
    ) -> Result<quinn::Endpoint> {
        let server_config = crypto::server_quic_config(tls, params)?;
        let mut endpoint = Self::endpoint_for(&socket, params)?;
        endpoint.set_server_config(Some(server_config));
        Ok(endpoint)
    }
}

/// A handshaken, peer-authenticated session ready for streams.
#[derive(Clone)]
pub struct Connection {
    session: quinn::Connection,
    local_peer: PeerId,
    local_multiaddr: Multiaddr,
    remote_peer: PeerId,
    remote_public_key: VerifyingKey,
    remote_multiaddr: Multiaddr,
}

impl Connection {
    pub(crate) fn new(
        session: quinn::Connection,
        local_peer: PeerId,
        local_multiaddr: Multiaddr,
        remote_peer: PeerId,
        remote_public_key: VerifyingKey,
        remote_multiaddr: Multiaddr,
    ) -> Self {
        Self {
            session,
            local_peer,
            local_multiaddr,
            remote_peer,
            remote_public_key,
            remote_multiaddr,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_public_key(&self) -> &VerifyingKey {
        &self.remote_public_key
    }

    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    pub async fn open_bi(
        &self,
    ) -> Result<(quinn::SendStream, quinn::RecvStream), quinn::ConnectionError> {
        self.session.open_bi().await
    }

    pub async fn accept_bi(
        &self,
    ) -> Result<(quinn::SendStream, quinn::RecvStream), quinn::ConnectionError> {
        self.session.accept_bi().await
    }

    pub fn close(&self, code: u32, reason: &[u8]) {
        self.session.close(quinn::VarInt::from_u32(code), reason);
    }

    /// Resolves once the session has terminated, whatever the cause.
    pub async fn closed(&self) -> quinn::ConnectionError {
        self.session.closed().await
    }

    pub fn session(&self) -> &quinn::Connection {
        &self.session
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_peer", &self.remote_peer)
            .field("remote_multiaddr", &self.remote_multiaddr)
            .finish_non_exhaustive()
    }
}

/// Per-dial hints. The simultaneous-connect pair mirrors the upgrader's
/// coordination signal: when both sides dial each other and this side holds
/// the server role, the dial becomes a hole punch instead of a handshake.
#[derive(Clone, Copy, Debug)]
pub struct DialOpts {
    pub simultaneous_connect: bool,
    pub is_client: bool,
}

impl Default for DialOpts {
    fn default() -> Self {
        Self {
            simultaneous_connect: false,
            is_client: true,
        }
    }
}

/// Construction knobs for [`QuicTransport`].
pub struct TransportConfig {
    /// Share sockets between listeners and dialers. Disabling it hands every
    /// caller a fresh single-use socket.
    pub enable_reuse: bool,
    pub reuse: ReuseConfig,
    /// QUIC engine override; defaults to [`QuinnEngine`].
    pub engine: Option<Arc<dyn QuicEngine>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            enable_reuse: true,
            reuse: ReuseConfig::default(),
            engine: None,
        }
    }
}

/// The transport: listens for and dials peer-authenticated QUIC sessions.
pub struct QuicTransport {
    keypair: Keypair,
    local_peer: PeerId,
    identity: TlsIdentity,
    manager: ConnManager,
    engine: Arc<dyn QuicEngine>,
    server_params: QuicParams,
    client_params: QuicParams,
    gater: Option<Arc<dyn ConnectionGater>>,
    hole_punching: Arc<PunchTable<Connection>>,
}

impl QuicTransport {
    pub fn new(
        keypair: Keypair,
        psk: Option<&[u8]>,
        gater: Option<Arc<dyn ConnectionGater>>,
    ) -> Result<Self> {
        Self::with_config(keypair, psk, gater, TransportConfig::default())
    }

    pub fn with_config(
        keypair: Keypair,
        psk: Option<&[u8]>,
        gater: Option<Arc<dyn ConnectionGater>>,
        config: TransportConfig,
    ) -> Result<Self> {
        if psk.is_some_and(|psk| !psk.is_empty()) {
            return Err(TransportError::PrivateNetworksUnsupported.into());
        }

        let local_peer = keypair.peer_id();
        let identity = TlsIdentity::new(&keypair)?;
        let manager = ConnManager::new(config.enable_reuse, config.reuse);
        let params = QuicParams::for_keypair(&keypair);

        Ok(Self {
            keypair,
            local_peer,
            identity,
            manager,
            engine: config
                .engine
                .unwrap_or_else(|| Arc::new(QuinnEngine)),
            server_params: params.clone(),
            client_params: params,
            gater,
            hole_punching: Arc::new(PunchTable::new()),
        })
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Whether this transport can dial `addr`: exactly
    /// `/ip4|ip6/<host>/udp/<port>/quic`, never DNS.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        multiaddr_to_udp(addr).is_ok()
    }

    /// Dial a peer-authenticated session to `raddr`, expecting `peer` on the
    /// other end.
    pub async fn dial(&self, raddr: &Multiaddr, peer: PeerId) -> Result<Connection> {
        self.dial_with(raddr, peer, DialOpts::default()).await
    }

    pub async fn dial_with(
        &self,
        raddr: &Multiaddr,
        peer: PeerId,
        opts: DialOpts,
    ) -> Result<Connection> {
        let (network, remote) = multiaddr_to_udp(raddr)?;
        let remote_multiaddr = udp_to_multiaddr(&remote);
        let (tls, mut key_rx) = self.identity.config_for_peer(&peer)?;

        if opts.simultaneous_connect && !opts.is_client {
            return self.hole_punch(network, remote, peer).await;
        }

        let socket = self.manager.dial(network, remote)?;
        let server_name = peer_id_to_sni(&peer);
        let session = match self
            .engine
            .connect(
                socket.clone(),
                remote,
                &server_name,
                tls,
                &self.client_params,
            )
            .await
        {
            Ok(session) => session,
            Err(e) => {
                socket.decrease();
                return Err(e);
            }
        };

        // The verifier pushed the key during the handshake; read it without
        // blocking. Its absence is a contract violation of the identity
        // layer.
        let remote_public_key = match key_rx.try_recv() {
            Ok(key) => key,
            Err(_) => {
                session.close(quinn::VarInt::from_u32(0), b"");
                socket.decrease();
                return Err(TransportError::MissingRemoteKey.into());
            }
        };

        // Exactly one watcher per successful dial releases the socket count.
        let watcher_socket = socket.clone();
        let watched = session.clone();
        tokio::spawn(async move {
            let reason = watched.closed().await;
            trace!(reason = %reason, "outbound session terminated");
            watcher_socket.decrease();
        });

        let connection = Connection::new(
            session,
            self.local_peer,
            udp_to_multiaddr(&socket.local_addr()),
            peer,
            remote_public_key,
            remote_multiaddr,
        );

        if let Some(gater) = &self.gater {
            if !gater.intercept_secured(Direction::Outbound, &peer, &connection) {
                connection.close(GATING_ERROR_CODE, b"connection gated");
                return Err(TransportError::ConnectionGated.into());
            }
        }

        debug!(peer = %peer, remote = %remote, "outbound connection established");
        Ok(connection)
    }

    /// Run the hole-punch transmit loop while the accept path races to
    /// deliver a matching inbound session.
    async fn hole_punch(
        &self,
        network: Network,
        remote: SocketAddr,
        peer: PeerId,
    ) -> Result<Connection> {
        let socket = self.manager.dial(network, remote)?;
        let key = PunchKey { addr: remote, peer };
        let mut delivery = match self.hole_punching.start(key) {
            Ok(rx) => rx,
            Err(e) => {
                socket.decrease();
                return Err(e.into());
            }
        };

        // Cleans up the table entry and the socket count if this future is
        // dropped mid-punch.
        let mut guard = PunchGuard {
            table: Arc::clone(&self.hole_punching),
            key,
            socket: socket.clone(),
            armed: true,
        };

        debug!(peer = %peer, remote = %remote, "hole punch started");
        let deadline = tokio::time::Instant::now() + HOLE_PUNCH_TIMEOUT;
        let mut payload = [0u8; HOLE_PUNCH_PAYLOAD_LEN];
        let mut attempt: u64 = 0;

        let punch_err: anyhow::Error = loop {
            rand::thread_rng().fill_bytes(&mut payload);
            if let Err(e) = socket.send_to(&payload, remote).await {
                break anyhow::Error::new(e).context("failed to send hole punch packet");
            }

            // Randomized, quadratically widening gap keeps both sides out of
            // lockstep while bounding the spacing near 210ms.
            let max_sleep = (10 * (attempt + 1) * (attempt + 1)).min(200);
            let delay = Duration::from_millis(10 + rand::thread_rng().gen_range(0..max_sleep));
            attempt += 1;

            // Biased so a ready delivery always wins the race: an unbiased
            // poll could pick a timer in the same cycle, consuming the
            // oneshot result and losing the session.
            tokio::select! {
                biased;
                delivered = &mut delivery => {
                    match delivered {
                        Ok(connection) => {
                            self.hole_punching.abandon(&key);
                            guard.disarm();
                            socket.decrease();
                            debug!(peer = %peer, remote = %remote, "hole punch succeeded");
                            return Ok(connection);
                        }
                        Err(_) => break anyhow::anyhow!("hole punch delivery channel closed"),
                    }
                }
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    break TransportError::HolePunchTimeout.into();
                }
            }
        };

        // A delivery may have raced with the failure; the salvage read under
        // the table lock keeps it from being discarded.
        let salvaged = self.hole_punching.finish(&key, &mut delivery);
        guard.disarm();
        socket.decrease();
        match salvaged {
            Some(connection) => {
                debug!(peer = %peer, remote = %remote, "hole punch salvaged a late delivery");
                Ok(connection)
            }
            None => {
                debug!(peer = %peer, remote = %remote, error = %punch_err, "hole punch failed");
                Err(punch_err)
            }
        }
    }

    /// Listen for inbound sessions at the multiaddr.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener> {
        let (network, local_addr) = multiaddr_to_udp(addr)?;
        let socket = self.manager.listen(network, local_addr).await?;

        let crypto = match self.identity.server_crypto() {
            Ok(crypto) => crypto,
            Err(e) => {
                socket.decrease();
                return Err(e);
            }
        };
        let endpoint = match self
            .engine
            .listen(socket.clone(), crypto, &self.server_params)
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                socket.decrease();
                return Err(e);
            }
        };

        Ok(Listener::start(
            endpoint,
            socket,
            self.local_peer,
            self.gater.clone(),
            Arc::clone(&self.hole_punching),
        ))
    }

    /// Close both reuse pools. In-flight sessions are torn down with their
    /// sockets.
    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }
}

impl std::fmt::Debug for QuicTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("local_peer", &self.local_peer)
            .finish_non_exhaustive()
    }
}

struct PunchGuard {
    table: Arc<PunchTable<Connection>>,
    key: PunchKey,
    socket: TransportSocket,
    armed: bool,
}

impl PunchGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PunchGuard {
    fn drop(&mut self) {
        if self.armed {
            self.table.abandon(&self.key);
            self.socket.decrease();
        }
    }
}

/// Convert a multiaddr of the exact shape `/ip4|ip6/<host>/udp/<port>/quic`
/// into a UDP address. DNS forms are rejected.
pub(crate) fn multiaddr_to_udp(addr: &Multiaddr) -> Result<(Network, SocketAddr)> {
    let mut protocols = addr.iter();
    let ip = match protocols.next() {
        Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
        Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
        _ => bail!("unsupported multiaddr {addr}: must start with ip4 or ip6"),
    };
    let port = match protocols.next() {
        Some(Protocol::Udp(port)) => port,
        _ => bail!("unsupported multiaddr {addr}: expected udp"),
    };
    match protocols.next() {
        Some(Protocol::Quic) => {}
        _ => bail!("unsupported multiaddr {addr}: expected quic"),
    }
    if protocols.next().is_some() {
        bail!("unsupported multiaddr {addr}: trailing protocols");
    }

    let socket_addr = SocketAddr::new(ip, port);
    Ok((Network::of_addr(&socket_addr), socket_addr))
}

/// The canonical QUIC multiaddr for a UDP address.
pub(crate) fn udp_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let mut maddr = Multiaddr::empty();
    match addr.ip() {
        IpAddr::V4(ip) => maddr.push(Protocol::Ip4(ip)),
        IpAddr::V6(ip) => maddr.push(Protocol::Ip6(ip)),
    }
    maddr.push(Protocol::Udp(addr.port()));
    maddr.push(Protocol::Quic);
    maddr
}
