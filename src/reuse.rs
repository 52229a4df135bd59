//! # Socket Reuse Pool
//!
//! Listening and dialing from the same local port is what makes NAT hole
//! punching possible: the remote peer sees a predictable return address. The
//! [`ReusePool`] makes that sharing automatic. It tracks every socket it has
//! handed out in two indices:
//!
//! - `global`: sockets bound to the wildcard address, keyed by port
//! - `unicast`: sockets bound to a specific local IP, keyed by IP then port
//!
//! A dial prefers a socket bound to the source IP the kernel would pick for
//! the remote, falls back to any wildcard socket, and only binds a fresh
//! wildcard socket when the pool is empty. Every successful Listen or Dial
//! increments the socket's reference count; callers pair each with exactly
//! one `decrease`.
//!
//! A background reaper closes sockets whose count has sat at zero for longer
//! than `max_unused_duration`. It runs only while the pool tracks at least
//! one socket, and shuts itself down when both indices drain.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::manager::Network;
use crate::socket::{BoundSocket, CountedSocket};

/// Timing knobs for the reuse pool.
///
/// Construction parameters rather than globals so tests can inject short
/// durations without cross-test interference.
#[derive(Clone, Copy, Debug)]
pub struct ReuseConfig {
    /// How often the reaper wakes to sweep both indices.
    pub garbage_collect_interval: std::time::Duration,
    /// How long a socket may sit at count zero before it is closed.
    pub max_unused_duration: std::time::Duration,
}

impl Default for ReuseConfig {
    fn default() -> Self {
        Self {
            garbage_collect_interval: std::time::Duration::from_secs(30),
            max_unused_duration: std::time::Duration::from_secs(10),
        }
    }
}

/// Reference-counted pool of UDP sockets for one address family.
///
/// Cheap to clone; all clones share the same indices and reaper.
#[derive(Clone)]
pub(crate) struct ReusePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    network: Network,
    config: ReuseConfig,
    /// Wakes the reaper early on shutdown.
    shutdown: Notify,
    state: Mutex<PoolState>,
}

struct PoolState {
    reaper_running: bool,
    closed: bool,
    reaper: Option<JoinHandle<()>>,
    /// Sockets bound to the wildcard address, keyed by local port.
    global: HashMap<u16, Arc<CountedSocket>>,
    /// Sockets bound to a specific unicast address.
    unicast: HashMap<IpAddr, HashMap<u16, Arc<CountedSocket>>>,
}

impl ReusePool {
    pub(crate) fn new(network: Network, config: ReuseConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                network,
                config,
                shutdown: Notify::new(),
                state: Mutex::new(PoolState {
                    reaper_running: false,
                    closed: false,
                    reaper: None,
                    global: HashMap::new(),
                    unicast: HashMap::new(),
                }),
            }),
        }
    }

    /// Bind a socket at `local_addr` and register it. The bind happens before
    /// the pool lock is taken; the OS is the authority on address collisions.
    pub(crate) async fn listen(&self, local_addr: SocketAddr) -> Result<Arc<CountedSocket>> {
        let socket = tokio::net::UdpSocket::bind(local_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket at {local_addr}"))?;
        let socket = Arc::new(CountedSocket::new(Arc::new(BoundSocket::new(socket)?)));
        socket.increase();
        let bound = socket.local_addr();

        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        if state.closed {
            bail!("reuse pool is closed");
        }
        self.ensure_reaper(&mut state);

        if bound.ip().is_unspecified() {
            state.global.insert(bound.port(), Arc::clone(&socket));
        } else {
            state
                .unicast
                .entry(bound.ip())
                .or_default()
                .insert(bound.port(), Arc::clone(&socket));
        }
        debug!(network = ?self.inner.network, addr = %bound, "registered listening socket");
        Ok(socket)
    }

    /// Pick a socket suitable for dialing `remote`, binding a fresh wildcard
    /// socket only when the pool has nothing to offer. The lock is held from
    /// index inspection through registration so the reaper cannot close a
    /// socket that is about to be handed out.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn dial(&self, remote: SocketAddr) -> Result<Arc<CountedSocket>> {
        let source_ips = source_ips(self.inner.network, remote);

        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        if state.closed {
            bail!("reuse pool is closed");
        }
        let socket = self.dial_locked(&mut state, &source_ips)?;
        socket.increase();
        self.ensure_reaper(&mut state);
        Ok(socket)
    }

    fn dial_locked(
        &self,
        state: &mut PoolState,
        source_ips: &[IpAddr],
    ) -> Result<Arc<CountedSocket>> {
        // A socket already bound to the source address the kernel would use.
        // Any port will do.
        for ip in source_ips {
            if let Some(sockets) = state.unicast.get(ip) {
                if let Some(socket) = sockets.values().next() {
                    return Ok(Arc::clone(socket));
                }
            }
        }

        // Any socket listening on the wildcard address.
        if let Some(socket) = state.global.values().next() {
            return Ok(Arc::clone(socket));
        }

        // Nothing to reuse: bind a wildcard socket on a random port. The
        // std bind is non-blocking, so doing it under the lock is fine.
        let std_socket = std::net::UdpSocket::bind(self.inner.network.wildcard(0))
            .context("failed to bind UDP socket for dialing")?;
        std_socket
            .set_nonblocking(true)
            .context("failed to set dial socket non-blocking")?;
        let socket = Arc::new(CountedSocket::new(Arc::new(BoundSocket::from_std(
            std_socket,
        )?)));
        let bound = socket.local_addr();
        state.global.insert(bound.port(), Arc::clone(&socket));
        debug!(network = ?self.inner.network, addr = %bound, "bound fresh dial socket");
        Ok(socket)
    }

    /// Must be called while holding the pool lock.
    fn ensure_reaper(&self, state: &mut PoolState) {
        if state.reaper_running {
            return;
        }
        state.reaper_running = true;
        let inner = Arc::clone(&self.inner);
        state.reaper = Some(tokio::spawn(run_reaper(inner)));
    }

    /// Close all tracked sockets, empty both indices, and wait for the
    /// reaper to exit.
    pub(crate) async fn close(&self) -> Result<()> {
        let reaper = {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.closed = true;
            for socket in state.global.values() {
                socket.close();
            }
            for sockets in state.unicast.values() {
                for socket in sockets.values() {
                    socket.close();
                }
            }
            state.global.clear();
            state.unicast.clear();
            state.reaper.take()
        };
        self.inner.shutdown.notify_one();
        if let Some(handle) = reaper {
            handle.await.context("socket reaper task panicked")?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn global_len(&self) -> usize {
        self.inner.state.lock().unwrap().global.len()
    }

    #[cfg(test)]
    fn unicast_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .unicast
            .values()
            .map(|sockets| sockets.len())
            .sum()
    }

    #[cfg(test)]
    fn reaper_running(&self) -> bool {
        self.inner.state.lock().unwrap().reaper_running
    }
}

impl std::fmt::Debug for ReusePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReusePool")
            .field("network", &self.inner.network)
            .finish_non_exhaustive()
    }
}

async fn run_reaper(inner: Arc<PoolInner>) {
    loop {
        // Read the interval each cycle so pools constructed with short test
        // configurations behave predictably.
        let interval = inner.config.garbage_collect_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = inner.shutdown.notified() => {}
        }

        let now = Instant::now();
        let max_unused = inner.config.max_unused_duration;
        let mut state = inner.state.lock().expect("pool lock poisoned");
        if state.closed {
            state.reaper_running = false;
            return;
        }

        state.global.retain(|port, socket| {
            if socket.should_reap(now, max_unused) {
                socket.close();
                debug!(port = *port, "reaped idle wildcard socket");
                false
            } else {
                true
            }
        });
        state.unicast.retain(|ip, sockets| {
            sockets.retain(|port, socket| {
                if socket.should_reap(now, max_unused) {
                    socket.close();
                    debug!(ip = %ip, port = *port, "reaped idle unicast socket");
                    false
                } else {
                    true
                }
            });
            !sockets.is_empty()
        });

        // Stop once nothing is tracked any more; the next Listen or Dial
        // starts a fresh reaper.
        if state.global.is_empty() && state.unicast.is_empty() {
            state.reaper_running = false;
            return;
        }
    }
}

/// Ask the kernel which local address it would use to reach `remote`.
///
/// Connecting a UDP socket performs the route lookup without sending any
/// traffic. An empty result means "no unicast preference" and leaves the
/// pool free to reuse or create a wildcard socket.
pub(crate) fn source_ips(network: Network, remote: SocketAddr) -> Vec<IpAddr> {
    let probe = match std::net::UdpSocket::bind(network.wildcard(0)) {
        Ok(socket) => socket,
        Err(e) => {
            trace!(error = %e, "source address query bind failed");
            return Vec::new();
        }
    };
    if let Err(e) = probe.connect(remote) {
        trace!(remote = %remote, error = %e, "source address query failed");
        return Vec::new();
    }
    match probe.local_addr() {
        Ok(addr) if !addr.ip().is_unspecified() => vec![addr.ip()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> ReuseConfig {
        ReuseConfig {
            garbage_collect_interval: Duration::from_millis(25),
            max_unused_duration: Duration::from_millis(100),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        check()
    }

    #[tokio::test]
    async fn listen_on_wildcard_registers_global_socket() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let socket = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();

        assert_eq!(socket.count(), 1);
        assert_eq!(pool.global_len(), 1);
        assert_eq!(pool.unicast_len(), 0);
    }

    #[tokio::test]
    async fn listen_on_ipv6_wildcard_is_keyed_by_port() {
        let pool = ReusePool::new(Network::Udp6, test_config());
        let socket = match pool.listen("[::]:0".parse().unwrap()).await {
            Ok(socket) => socket,
            // Hosts without IPv6 cannot run this scenario.
            Err(_) => return,
        };

        assert_eq!(socket.count(), 1);
        let port = socket.local_addr().port();
        assert!(port > 0);
        let state = pool.inner.state.lock().unwrap();
        assert!(state.global.contains_key(&port));
    }

    #[tokio::test]
    async fn listen_on_unicast_address_registers_unicast_socket() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let socket = pool.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        assert_eq!(socket.count(), 1);
        assert_eq!(pool.global_len(), 0);
        assert_eq!(pool.unicast_len(), 1);
    }

    #[tokio::test]
    async fn dial_with_empty_pool_binds_wildcard_socket() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let socket = pool.dial("1.1.1.1:1234".parse().unwrap()).unwrap();

        assert_eq!(socket.count(), 1);
        let local = socket.local_addr();
        assert!(local.ip().is_unspecified());
        assert!(local.port() > 0);
        assert_eq!(pool.global_len(), 1);
    }

    #[tokio::test]
    async fn dial_reuses_socket_created_for_listening() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let listener = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();
        assert_eq!(listener.count(), 1);

        let dialer = pool.dial("1.1.1.1:1234".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&listener, &dialer));
        assert_eq!(dialer.count(), 2);
    }

    #[tokio::test]
    async fn dial_prefers_socket_on_kernel_source_address() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let remote: SocketAddr = "1.1.1.1:1234".parse().unwrap();

        let ips = source_ips(Network::Udp4, remote);
        let Some(ip) = ips.first() else {
            // No route to the probe target; nothing to assert here.
            return;
        };

        let listener = pool
            .listen(SocketAddr::new(*ip, 0))
            .await
            .expect("listen on resolved source address");
        assert_eq!(listener.count(), 1);

        let dialer = pool.dial(remote).unwrap();
        assert!(Arc::ptr_eq(&listener, &dialer));
        assert_eq!(dialer.count(), 2);
    }

    #[tokio::test]
    async fn reaper_collects_sockets_once_unused() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let socket = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();
        assert_eq!(pool.global_len(), 1);

        socket.decrease();
        let drained = wait_until(|| pool.global_len() == 0, Duration::from_secs(2)).await;
        assert!(drained, "idle socket was not reaped");

        let stopped = wait_until(|| !pool.reaper_running(), Duration::from_secs(2)).await;
        assert!(stopped, "reaper kept running with empty indices");
    }

    #[tokio::test]
    async fn reaper_does_not_collect_sockets_in_use() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let _socket = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.global_len(), 1);
        assert!(pool.reaper_running());
    }

    #[tokio::test]
    async fn reaper_stops_only_when_no_sockets_remain() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        let first = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();
        let second = pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();
        assert!(pool.reaper_running());

        first.decrease();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            pool.reaper_running(),
            "reaper stopped while a socket was still tracked"
        );
        assert_eq!(pool.global_len(), 1);

        second.decrease();
        let stopped = wait_until(|| !pool.reaper_running(), Duration::from_secs(2)).await;
        assert!(stopped);
    }

    #[tokio::test]
    async fn close_empties_indices_and_rejects_further_use() {
        let pool = ReusePool::new(Network::Udp4, test_config());
        pool.listen("0.0.0.0:0".parse().unwrap()).await.unwrap();
        pool.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        pool.close().await.unwrap();
        assert_eq!(pool.global_len(), 0);
        assert_eq!(pool.unicast_len(), 0);
        assert!(!pool.reaper_running());

        assert!(pool.dial("1.1.1.1:1234".parse().unwrap()).is_err());
        assert!(pool.listen("0.0.0.0:0".parse().unwrap()).await.is_err());
    }

    #[test]
    fn source_ips_returns_concrete_or_empty() {
        let ips = source_ips(Network::Udp4, "1.1.1.1:1234".parse().unwrap());
        for ip in ips {
            assert!(!ip.is_unspecified());
        }
    }
}
