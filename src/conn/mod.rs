//! Raw connections underneath the TLS layer.
//!
//! Dial strategies and the plain-HTTP path of the transport open their
//! sockets through a connector: a [`tower::Service`] from [`Target`] to a
//! byte stream. [`tcp::TcpConnector`] is the default,
//! [`tunnel::TunnelConnector`] adds forward proxy support on top of it, and
//! tests substitute in-memory or never-completing connectors.

use std::fmt;
use std::net::SocketAddr;

use crate::dial::{Address, Network};

pub mod dns;
pub mod tcp;
pub mod tunnel;

pub use self::tcp::{TcpConfig, TcpConnector};
pub use self::tunnel::TunnelConnector;

/// Where a connector should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// The network kind to use.
    pub network: Network,

    /// The `host:port` to connect to.
    pub address: Address,
}

impl Target {
    /// Create a new connection target.
    pub fn new(network: Network, address: Address) -> Self {
        Self { network, address }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.address)
    }
}

/// Streams that may know the address of their peer.
pub trait PeerAddr {
    /// The remote socket address, if there is one.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

impl PeerAddr for tokio::net::TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        tokio::net::TcpStream::peer_addr(self).ok()
    }
}

impl PeerAddr for tokio::io::DuplexStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
