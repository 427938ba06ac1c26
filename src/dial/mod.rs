//! Dial strategies: pluggable ways of opening a TLS connection.
//!
//! A [`TlsDialer`] takes a [`Network`] and a `host:port` address and returns a
//! [`TlsConnection`] whose handshake has already completed. The
//! [`Transport`][crate::Transport] calls its strategy once per new connection,
//! possibly from many tasks at once, so every strategy must be `Send + Sync`.
//! Strategies that keep state (see [`proxy::ProxyTlsDialer`]) synchronize it
//! themselves.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{BoxError, BoxFuture};

pub mod basic;
pub mod pinning;
pub mod policy;
pub mod proxy;
pub(crate) mod tls;

pub use self::policy::{Verification, VerificationPolicy};

/// A strategy for opening TLS connections.
pub trait TlsDialer: fmt::Debug + Send + Sync + 'static {
    /// Open a connection to `address` over `network` and complete a TLS
    /// handshake on it.
    ///
    /// Errors are returned as they occurred; strategies do not retry.
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>>;
}

impl<D: TlsDialer + ?Sized> TlsDialer for Arc<D> {
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        (**self).dial_tls(network, address)
    }
}

impl<D: TlsDialer + ?Sized> TlsDialer for Box<D> {
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        (**self).dial_tls(network, address)
    }
}

/// The kind of network a dial should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Network {
    /// TCP over IPv4 or IPv6.
    #[default]
    Tcp,

    /// TCP over IPv4 only.
    Tcp4,

    /// TCP over IPv6 only.
    Tcp6,
}

impl Network {
    /// The name of this network, as accepted by [`Network::from_str`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
        }
    }

    pub(crate) fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Network::Tcp => true,
            Network::Tcp4 => addr.is_ipv4(),
            Network::Tcp6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Network::Tcp),
            "tcp4" => Ok(Network::Tcp4),
            "tcp6" => Ok(Network::Tcp6),
            other => Err(DialError::UnsupportedNetwork(other.to_owned())),
        }
    }
}

/// A parsed `host:port` dial target.
///
/// The original text is kept verbatim: policy decisions compare against it,
/// never against a normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    raw: Box<str>,
    host: Box<str>,
    port: u16,
}

impl Address {
    /// Parse `host:port` or `[ipv6]:port`.
    pub fn parse(address: &str) -> Result<Self, DialError> {
        let invalid = |reason| DialError::InvalidAddress {
            address: address.to_owned(),
            reason,
        };

        let (host, port) = address.rsplit_once(':').ok_or(invalid("missing port"))?;
        let host = match host.strip_prefix('[') {
            Some(rest) => rest.strip_suffix(']').ok_or(invalid("unclosed bracket"))?,
            None if host.contains(':') => return Err(invalid("ipv6 host must be bracketed")),
            None => host,
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = port.parse().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            raw: address.into(),
            host: host.into(),
            port,
        })
    }

    /// The address exactly as it was given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The host part, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port part.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Address {
    type Err = DialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

/// Byte streams a TLS connection can be layered over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// What is known about an established TLS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TlsConnectionInfo {
    /// The address that was dialed.
    pub address: String,

    /// The server name sent via SNI and checked (when validation is full).
    pub server_name: String,

    /// How the peer certificate was validated.
    pub verification: Verification,

    /// The application protocol negotiated with ALPN.
    pub alpn: Option<String>,

    /// The negotiated TLS version.
    pub protocol_version: Option<rustls::ProtocolVersion>,

    /// The socket address of the peer, when the raw stream exposed one.
    pub remote_addr: Option<SocketAddr>,
}

/// A connection with a completed TLS handshake.
pub struct TlsConnection {
    stream: tokio_rustls::client::TlsStream<Box<dyn Io>>,
    info: TlsConnectionInfo,
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("info", &self.info)
            .finish()
    }
}

impl TlsConnection {
    pub(crate) fn new(
        stream: tokio_rustls::client::TlsStream<Box<dyn Io>>,
        address: &Address,
        server_name: String,
        verification: Verification,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (_, session) = stream.get_ref();
        let alpn = session
            .alpn_protocol()
            .and_then(|proto| std::str::from_utf8(proto).ok())
            .map(str::to_owned);
        let info = TlsConnectionInfo {
            address: address.as_str().to_owned(),
            server_name,
            verification,
            alpn,
            protocol_version: session.protocol_version(),
            remote_addr,
        };

        Self { stream, info }
    }

    /// Information about the connection.
    pub fn info(&self) -> &TlsConnectionInfo {
        &self.info
    }

    /// The certificate chain the peer presented, leaf first.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        self.stream.get_ref().1.peer_certificates().unwrap_or_default()
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}

/// Errors from dialing a TLS connection.
///
/// Connect-phase and handshake-phase failures are separate variants; use
/// [`DialError::is_connect`] and [`DialError::is_handshake`] to tell them apart.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DialError {
    /// The address is not a valid `host:port`.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress {
        /// The rejected address.
        address: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The network kind is not one of `tcp`, `tcp4` or `tcp6`.
    #[error("unsupported network {0:?}")]
    UnsupportedNetwork(String),

    /// The host could not be resolved.
    #[error("resolving {address}: {source}")]
    Resolve {
        /// The address being dialed.
        address: String,
        /// The resolver error.
        #[source]
        source: io::Error,
    },

    /// The raw connection could not be established.
    #[error("connecting to {address}: {source}")]
    Connect {
        /// The address being dialed.
        address: String,
        /// The socket error.
        #[source]
        source: io::Error,
    },

    /// The raw connection was not established within the connect timeout.
    #[error("connecting to {address}: timed out after {timeout:?}")]
    ConnectTimeout {
        /// The address being dialed.
        address: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The TLS handshake failed, including certificate rejection.
    #[error("tls handshake with {address}: {source}")]
    Handshake {
        /// The address being dialed.
        address: String,
        /// The handshake error.
        #[source]
        source: io::Error,
    },

    /// The TLS handshake did not finish within the handshake timeout.
    #[error("tls handshake with {address}: timed out after {timeout:?}")]
    HandshakeTimeout {
        /// The address being dialed.
        address: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The handshake succeeded but the peer certificate was refused by a
    /// higher-level check such as pinning.
    #[error("certificate for {address} rejected: {reason}")]
    Rejected {
        /// The address being dialed.
        address: String,
        /// Why the certificate was refused.
        reason: String,
    },

    /// No alternate route could be found after the direct dial failed.
    #[error("no route to {address}: {source}")]
    Routing {
        /// The address being dialed.
        address: String,
        /// The discovery error.
        #[source]
        source: BoxError,
    },
}

impl DialError {
    /// Returns `true` if the failure happened before any TLS bytes were exchanged.
    pub fn is_connect(&self) -> bool {
        matches!(
            self,
            DialError::Resolve { .. } | DialError::Connect { .. } | DialError::ConnectTimeout { .. }
        )
    }

    /// Returns `true` if the failure happened during or after the TLS handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            DialError::Handshake { .. }
                | DialError::HandshakeTimeout { .. }
                | DialError::Rejected { .. }
        )
    }

    /// Returns `true` if a timeout caused the failure.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DialError::ConnectTimeout { .. } | DialError::HandshakeTimeout { .. }
        )
    }
}
