//! # Shared UDP Sockets
//!
//! A [`BoundSocket`] is a UDP endpoint plus the machinery needed to share it:
//! a quinn [`AsyncUdpSocket`] adapter so one socket can back a QUIC endpoint,
//! and a lazily-filled endpoint slot so the listening and dialing roles drive
//! the same endpoint instead of competing for packets.
//!
//! A [`CountedSocket`] layers a reference count and an idle timestamp on top;
//! the reuse pool hands these out and reaps them once idle. When reuse is
//! disabled, callers get an uncounted socket instead. [`TransportSocket`]
//! is the sum of the two shapes and is what the rest of the transport
//! passes around.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use anyhow::Result;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tracing::debug;

/// A bound UDP endpoint shareable between a QUIC endpoint and raw sends.
pub struct BoundSocket {
    socket: tokio::net::UdpSocket,
    local_addr: SocketAddr,
    /// At most one QUIC endpoint is ever created per socket; the slot is
    /// emptied when the socket is closed so the endpoint's reference back to
    /// this socket is dropped.
    endpoint: Mutex<Option<quinn::Endpoint>>,
}

impl BoundSocket {
    pub(crate) fn new(socket: tokio::net::UdpSocket) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            endpoint: Mutex::new(None),
        })
    }

    /// Wrap an already-bound std socket. The socket must be non-blocking.
    pub(crate) fn from_std(socket: std::net::UdpSocket) -> io::Result<Self> {
        Self::new(tokio::net::UdpSocket::from_std(socket)?)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    /// Return the socket's QUIC endpoint, creating it with `make` on first
    /// use. Subsequent callers in either role share the same endpoint.
    pub(crate) fn endpoint_or_init(
        &self,
        make: impl FnOnce() -> Result<quinn::Endpoint>,
    ) -> Result<quinn::Endpoint> {
        let mut slot = self.endpoint.lock().expect("endpoint slot lock poisoned");
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }
        let endpoint = make()?;
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }

    /// Close the endpoint attached to this socket, if any. Emptying the slot
    /// drops the endpoint's handle on this socket, so the file descriptor is
    /// released once the last user goes away.
    pub(crate) fn close_endpoint(&self) {
        let endpoint = self
            .endpoint
            .lock()
            .expect("endpoint slot lock poisoned")
            .take();
        if let Some(endpoint) = endpoint {
            debug!(addr = %self.local_addr, "closing QUIC endpoint on socket");
            endpoint.close(quinn::VarInt::from_u32(0), b"");
        }
    }
}

impl std::fmt::Debug for BoundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSocket")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

struct BoundSocketPoller {
    inner: Arc<BoundSocket>,
}

impl std::fmt::Debug for BoundSocketPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundSocketPoller").finish_non_exhaustive()
    }
}

impl UdpPoller for BoundSocketPoller {
    fn poll_writable(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        self.inner.socket.poll_send_ready(cx)
    }
}

impl AsyncUdpSocket for BoundSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Box::pin(BoundSocketPoller { inner: self })
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.socket
            .try_send_to(transmit.contents, transmit.destination)
            .map(|_| ())
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        debug_assert!(!bufs.is_empty() && !meta.is_empty());

        let mut buf = [0u8; 65535];
        let mut read_buf = tokio::io::ReadBuf::new(&mut buf);

        match self.socket.poll_recv_from(cx, &mut read_buf) {
            Poll::Ready(Ok(src_addr)) => {
                let received = read_buf.filled();
                let copy_len = received.len().min(bufs[0].len());
                bufs[0][..copy_len].copy_from_slice(&received[..copy_len]);

                meta[0] = RecvMeta {
                    addr: src_addr,
                    len: copy_len,
                    stride: copy_len,
                    ecn: None,
                    dst_ip: None,
                };

                Poll::Ready(Ok(1))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct CountState {
    ref_count: usize,
    /// Set exactly when the count drops to zero, cleared on increase.
    unused_since: Option<Instant>,
}

/// A pooled socket: UDP endpoint plus reference count and idle timestamp.
///
/// Users never close a counted socket; the pool's reaper does, once the
/// count has sat at zero for longer than the configured unused duration.
#[derive(Debug)]
pub struct CountedSocket {
    io: Arc<BoundSocket>,
    state: Mutex<CountState>,
}

impl CountedSocket {
    pub(crate) fn new(io: Arc<BoundSocket>) -> Self {
        Self {
            io,
            state: Mutex::new(CountState {
                ref_count: 0,
                unused_since: None,
            }),
        }
    }

    pub fn increase(&self) {
        let mut state = self.state.lock().expect("socket state lock poisoned");
        state.ref_count += 1;
        state.unused_since = None;
    }

    pub fn decrease(&self) {
        let mut state = self.state.lock().expect("socket state lock poisoned");
        debug_assert!(state.ref_count > 0, "decrease without matching increase");
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            state.unused_since = Some(Instant::now());
        }
    }

    pub fn count(&self) -> usize {
        self.state
            .lock()
            .expect("socket state lock poisoned")
            .ref_count
    }

    pub(crate) fn should_reap(&self, now: Instant, max_unused: Duration) -> bool {
        let state = self.state.lock().expect("socket state lock poisoned");
        matches!(
            state.unused_since,
            Some(idle_since) if now.saturating_duration_since(idle_since) >= max_unused
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.io.local_addr()
    }

    pub(crate) fn io(&self) -> &Arc<BoundSocket> {
        &self.io
    }

    /// Tear down the socket's endpoint. Called by the reaper and by pool
    /// shutdown only.
    pub(crate) fn close(&self) {
        self.io.close_endpoint();
    }
}

/// The socket handle handed out by the connection manager.
///
/// `Pooled` sockets participate in reference counting and reaping.
/// `Ephemeral` sockets exist for a single listener or dial: their count
/// operations are no-ops, and releasing one tears its endpoint down so the
/// socket's lifetime coincides with its one use.
#[derive(Clone, Debug)]
pub enum TransportSocket {
    Pooled(Arc<CountedSocket>),
    Ephemeral(Arc<BoundSocket>),
}

impl TransportSocket {
    pub fn increase(&self) {
        match self {
            TransportSocket::Pooled(socket) => socket.increase(),
            TransportSocket::Ephemeral(_) => {}
        }
    }

    pub fn decrease(&self) {
        match self {
            TransportSocket::Pooled(socket) => socket.decrease(),
            TransportSocket::Ephemeral(socket) => socket.close_endpoint(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        match self {
            TransportSocket::Pooled(socket) => socket.local_addr(),
            TransportSocket::Ephemeral(socket) => socket.local_addr(),
        }
    }

    pub(crate) fn io(&self) -> Arc<BoundSocket> {
        match self {
            TransportSocket::Pooled(socket) => Arc::clone(socket.io()),
            TransportSocket::Ephemeral(socket) => Arc::clone(socket),
        }
    }

    pub(crate) async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.io().send_to(buf, target).await
    }
}
