//! TCP connector for raw connections.
//!
//! [`TcpConnector`] resolves the target host, drops addresses the requested
//! [`Network`][crate::dial::Network] cannot use, and tries the remaining
//! addresses in order until one connects. It does not apply a timeout of its
//! own: the dial strategy bounds the whole connect phase.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream};
use tower::ServiceExt as _;
use tracing::{trace, warn, Instrument};

use super::dns::{GaiResolver, SocketAddrs};
use super::Target;
use crate::config::TCP_KEEPALIVE;
use crate::dial::DialError;

/// Socket options for raw TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpConfig {
    /// Keep-alive interval, or `None` to leave keep-alive off.
    pub keep_alive: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            keep_alive: Some(TCP_KEEPALIVE),
            nodelay: true,
        }
    }
}

/// Connects to a [`Target`] over TCP.
///
/// The resolver `R` is a [`tower::Service`] from a hostname to
/// [`SocketAddrs`]; [`GaiResolver`] by default. IP literals skip the resolver.
#[derive(Debug, Clone)]
pub struct TcpConnector<R = GaiResolver> {
    config: TcpConfig,
    resolver: R,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    /// A connector using the system resolver and default socket options.
    pub fn new() -> Self {
        Self {
            config: TcpConfig::default(),
            resolver: GaiResolver::new(),
        }
    }
}

impl<R> TcpConnector<R> {
    /// Use a different resolver.
    pub fn with_resolver<R2>(self, resolver: R2) -> TcpConnector<R2> {
        TcpConnector {
            config: self.config,
            resolver,
        }
    }

    /// Use different socket options.
    pub fn with_config(mut self, config: TcpConfig) -> Self {
        self.config = config;
        self
    }

    /// The socket options in use.
    pub fn config(&self) -> &TcpConfig {
        &self.config
    }
}

type BoxFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

impl<R> tower::Service<Target> for TcpConnector<R>
where
    R: tower::Service<Box<str>, Response = SocketAddrs, Error = io::Error>
        + Clone
        + Send
        + 'static,
    R::Future: Send,
{
    type Response = TcpStream;
    type Error = DialError;
    type Future = BoxFuture<TcpStream, DialError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let connector = self.clone();
        let span = tracing::trace_span!("tcp", address = %target.address, network = %target.network);
        Box::pin(async move { connector.connect(target).await }.instrument(span))
    }
}

impl<R> TcpConnector<R>
where
    R: tower::Service<Box<str>, Response = SocketAddrs, Error = io::Error>
        + Clone
        + Send
        + 'static,
    R::Future: Send,
{
    async fn connect(self, target: Target) -> Result<TcpStream, DialError> {
        let mut addrs = resolve(self.resolver, &target).await?;
        trace!(candidates = addrs.len(), "resolved");

        let mut last_error = None;
        while let Some(addr) = addrs.pop() {
            match connect(&addr, &self.config)
                .instrument(tracing::trace_span!("connect", remote.addr = %addr))
                .await
            {
                Ok(stream) => {
                    trace!(remote.addr = %addr, "tcp connected");
                    return Ok(stream);
                }
                Err(error) => {
                    trace!(remote.addr = %addr, %error, "tcp connect attempt failed");
                    last_error = Some(error);
                }
            }
        }

        Err(DialError::Connect {
            address: target.address.to_string(),
            source: last_error
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no candidates")),
        })
    }
}

async fn resolve<R>(resolver: R, target: &Target) -> Result<SocketAddrs, DialError>
where
    R: tower::Service<Box<str>, Response = SocketAddrs, Error = io::Error>,
{
    let address = &target.address;
    let mut addrs = match address.host().parse::<IpAddr>() {
        Ok(ip) => SocketAddrs::from_iter([SocketAddr::new(ip, 0)]),
        Err(_) => resolver
            .oneshot(address.host().into())
            .await
            .map_err(|source| DialError::Resolve {
                address: address.to_string(),
                source,
            })?,
    };
    addrs.set_port(address.port());
    addrs.retain_network(target.network);

    if addrs.is_empty() {
        return Err(DialError::Resolve {
            address: address.to_string(),
            source: io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} addresses found", target.network),
            ),
        });
    }

    Ok(addrs)
}

async fn connect(addr: &SocketAddr, config: &TcpConfig) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;

    if let Some(time) = config.keep_alive {
        let keepalive = TcpKeepalive::new().with_time(time).with_interval(time);
        if let Err(error) = socket.set_tcp_keepalive(&keepalive) {
            warn!(%error, "tcp set_keepalive error");
        }
    }

    if let Err(error) = socket.set_nodelay(config.nodelay) {
        warn!(%error, "tcp set_nodelay error");
    }

    let socket = TcpSocket::from_std_stream(std::net::TcpStream::from(socket));
    socket.connect(*addr).await
}
