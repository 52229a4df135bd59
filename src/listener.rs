//! # QUIC Listener
//!
//! Wraps an accepting endpoint over a counted socket. Each inbound session
//! is authenticated (the client certificate must carry a valid Ed25519 key),
//! gated, and then offered to the hole-punch table: a session whose remote
//! address and peer match a punch in flight is delivered to that dialer and
//! never surfaces here. Everything else is queued for [`Listener::accept`].
//!
//! Closing the listener releases its socket count exactly once. On a pooled
//! socket the endpoint itself stays up until the reaper collects the socket,
//! so sessions dialed out of the same socket keep working.

use std::net::SocketAddr;
use std::sync::Arc;

use multiaddr::Multiaddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::crypto::extract_verified_peer;
use crate::identity::PeerId;
use crate::punch::{PunchKey, PunchTable};
use crate::socket::TransportSocket;
use crate::transport::{
    udp_to_multiaddr, Connection, ConnectionGater, Direction, GATING_ERROR_CODE, INCOMING_QUEUE,
};

/// Accepts inbound peer-authenticated sessions on one socket.
pub struct Listener {
    endpoint: quinn::Endpoint,
    socket: TransportSocket,
    local_multiaddr: Multiaddr,
    incoming: mpsc::Receiver<Connection>,
    accept_task: JoinHandle<()>,
    closed: bool,
}

impl Listener {
    pub(crate) fn start(
        endpoint: quinn::Endpoint,
        socket: TransportSocket,
        local_peer: PeerId,
        gater: Option<Arc<dyn ConnectionGater>>,
        punches: Arc<PunchTable<Connection>>,
    ) -> Self {
        let local_multiaddr = udp_to_multiaddr(&socket.local_addr());
        let (incoming_tx, incoming) = mpsc::channel(INCOMING_QUEUE);
        let accept_task = tokio::spawn(accept_loop(
            endpoint.clone(),
            incoming_tx,
            local_peer,
            local_multiaddr.clone(),
            gater,
            punches,
        ));
        debug!(addr = %socket.local_addr(), "listener started");
        Self {
            endpoint,
            socket,
            local_multiaddr,
            incoming,
            accept_task,
            closed: false,
        }
    }

    /// The next inbound connection that was not claimed by a hole punch.
    /// Returns `None` once the listener has been closed.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }

    pub fn multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Stop accepting and release the socket count.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.accept_task.abort();
        self.incoming.close();
        let mut endpoint = self.endpoint.clone();
        endpoint.set_server_config(None);
        self.socket.decrease();
        debug!(addr = %self.socket.local_addr(), "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_multiaddr", &self.local_multiaddr)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    endpoint: quinn::Endpoint,
    incoming_tx: mpsc::Sender<Connection>,
    local_peer: PeerId,
    local_multiaddr: Multiaddr,
    gater: Option<Arc<dyn ConnectionGater>>,
    punches: Arc<PunchTable<Connection>>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let incoming_tx = incoming_tx.clone();
        let local_multiaddr = local_multiaddr.clone();
        let gater = gater.clone();
        let punches = Arc::clone(&punches);

        tokio::spawn(async move {
            let session = match incoming.await {
                Ok(session) => session,
                Err(e) => {
                    debug!(error = %e, "inbound QUIC handshake failed");
                    return;
                }
            };
            let remote_addr = session.remote_address();

            let Some((remote_peer, remote_public_key)) = extract_verified_peer(&session) else {
                debug!(addr = %remote_addr, "inbound session carries no verifiable identity");
                session.close(quinn::VarInt::from_u32(0), b"missing identity");
                return;
            };

            let connection = Connection::new(
                session,
                local_peer,
                local_multiaddr,
                remote_peer,
                remote_public_key,
                udp_to_multiaddr(&remote_addr),
            );

            if let Some(gater) = &gater {
                if !gater.intercept_secured(Direction::Inbound, &remote_peer, &connection) {
                    debug!(peer = %remote_peer, addr = %remote_addr, "inbound connection gated");
                    connection.close(GATING_ERROR_CODE, b"connection gated");
                    return;
                }
            }

            // A punch in flight toward this exact address and peer claims
            // the session; only unmatched sessions reach accept().
            let key = PunchKey {
                addr: remote_addr,
                peer: remote_peer,
            };
            match punches.deliver(&key, connection) {
                Ok(()) => {}
                Err(connection) => {
                    if let Err(e) = incoming_tx.send(connection).await {
                        // Listener gone; drop the session.
                        e.0.close(0, b"listener closed");
                    }
                }
            }
        });
    }
}
