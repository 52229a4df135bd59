//! # Connection Manager
//!
//! Dispatches Listen and Dial requests to the per-family [`ReusePool`]s, or
//! hands out single-use sockets when port reuse has been disabled. This is
//! the only place that knows whether reuse is on; everything above it deals
//! in [`TransportSocket`]s and pairs each acquisition with one `decrease`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::reuse::{ReuseConfig, ReusePool};
use crate::socket::{BoundSocket, TransportSocket};
use crate::transport::TransportError;

/// UDP address family token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Udp4,
    Udp6,
}

impl Network {
    /// The family a socket address belongs to.
    pub fn of_addr(addr: &SocketAddr) -> Self {
        if addr.is_ipv4() {
            Network::Udp4
        } else {
            Network::Udp6
        }
    }

    /// The wildcard bind address for this family.
    pub fn wildcard(self, port: u16) -> SocketAddr {
        match self {
            Network::Udp4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            Network::Udp6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
        }
    }
}

impl FromStr for Network {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp4" => Ok(Network::Udp4),
            "udp6" => Ok(Network::Udp6),
            other => Err(TransportError::InvalidNetwork(other.to_string())),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routes socket acquisition per address family.
pub(crate) struct ConnManager {
    reuse_udp4: ReusePool,
    reuse_udp6: ReusePool,
    reuse_enabled: bool,
}

impl ConnManager {
    pub(crate) fn new(reuse_enabled: bool, config: ReuseConfig) -> Self {
        Self {
            reuse_udp4: ReusePool::new(Network::Udp4, config),
            reuse_udp6: ReusePool::new(Network::Udp6, config),
            reuse_enabled,
        }
    }

    fn pool(&self, network: Network) -> &ReusePool {
        match network {
            Network::Udp4 => &self.reuse_udp4,
            Network::Udp6 => &self.reuse_udp6,
        }
    }

    pub(crate) async fn listen(
        &self,
        network: Network,
        local_addr: SocketAddr,
    ) -> Result<TransportSocket> {
        if self.reuse_enabled {
            let socket = self.pool(network).listen(local_addr).await?;
            return Ok(TransportSocket::Pooled(socket));
        }

        let socket = tokio::net::UdpSocket::bind(local_addr)
            .await
            .with_context(|| format!("failed to bind UDP socket at {local_addr}"))?;
        Ok(TransportSocket::Ephemeral(Arc::new(BoundSocket::new(
            socket,
        )?)))
    }

    pub(crate) fn dial(&self, network: Network, remote: SocketAddr) -> Result<TransportSocket> {
        if self.reuse_enabled {
            let socket = self.pool(network).dial(remote)?;
            return Ok(TransportSocket::Pooled(socket));
        }

        let std_socket = std::net::UdpSocket::bind(network.wildcard(0))
            .context("failed to bind UDP socket for dialing")?;
        std_socket
            .set_nonblocking(true)
            .context("failed to set dial socket non-blocking")?;
        Ok(TransportSocket::Ephemeral(Arc::new(
            BoundSocket::from_std(std_socket)?,
        )))
    }

    /// Close both pools; both are closed even if the first fails, and the
    /// first failure is the one reported.
    pub(crate) async fn close(&self) -> Result<()> {
        let udp6 = self.reuse_udp6.close().await;
        let udp4 = self.reuse_udp4.close().await;
        udp6.and(udp4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_token_parses_exactly_two_values() {
        assert_eq!("udp4".parse::<Network>().unwrap(), Network::Udp4);
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp6);

        let err = "tcp4".parse::<Network>().unwrap_err();
        assert!(matches!(err, TransportError::InvalidNetwork(_)));
        assert!(err.to_string().contains("udp4 or udp6"));
    }

    #[test]
    fn network_of_addr_matches_family() {
        let v4: SocketAddr = "127.0.0.1:1".parse().unwrap();
        assert_eq!(Network::of_addr(&v4), Network::Udp4);
        let v6: SocketAddr = "[::1]:1".parse().unwrap();
        assert_eq!(Network::of_addr(&v6), Network::Udp6);
    }

    #[tokio::test]
    async fn reuse_enabled_hands_out_pooled_sockets() {
        let manager = ConnManager::new(true, ReuseConfig::default());
        let listener = manager
            .listen(Network::Udp4, "0.0.0.0:0".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(listener, TransportSocket::Pooled(_)));

        let dialer = manager
            .dial(Network::Udp4, "1.1.1.1:1234".parse().unwrap())
            .unwrap();
        assert!(matches!(dialer, TransportSocket::Pooled(_)));
        // Both refer to the same pooled socket.
        assert_eq!(listener.local_addr(), dialer.local_addr());

        listener.decrease();
        dialer.decrease();
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn reuse_disabled_hands_out_ephemeral_sockets() {
        let manager = ConnManager::new(false, ReuseConfig::default());
        let listener = manager
            .listen(Network::Udp4, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(listener, TransportSocket::Ephemeral(_)));

        let dialer = manager
            .dial(Network::Udp4, "1.1.1.1:1234".parse().unwrap())
            .unwrap();
        assert!(matches!(dialer, TransportSocket::Ephemeral(_)));
        // Ephemeral sockets are never shared.
        assert_ne!(listener.local_addr().port(), 0);
        assert_ne!(listener.local_addr(), dialer.local_addr());

        manager.close().await.unwrap();
    }
}
