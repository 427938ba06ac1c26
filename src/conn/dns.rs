//! Hostname resolution for raw connections.

use std::collections::VecDeque;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;

use crate::dial::Network;

/// An ordered set of socket addresses produced by a resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketAddrs(VecDeque<SocketAddr>);

impl SocketAddrs {
    /// Replace the port of every address.
    pub fn set_port(&mut self, port: u16) {
        for addr in &mut self.0 {
            addr.set_port(port)
        }
    }

    /// Drop addresses that `network` cannot reach.
    pub fn retain_network(&mut self, network: Network) {
        self.0.retain(|addr| network.accepts(addr));
    }

    pub(crate) fn pop(&mut self) -> Option<SocketAddr> {
        self.0.pop_front()
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no addresses left.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the addresses in connection order.
    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.0.iter()
    }
}

impl FromIterator<SocketAddr> for SocketAddrs {
    fn from_iter<T: IntoIterator<Item = SocketAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for SocketAddrs {
    type Item = SocketAddr;
    type IntoIter = std::collections::vec_deque::IntoIter<SocketAddr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// GetAddrInfo based resolver.
///
/// Resolves hostnames with the operating system's `getaddrinfo` on tokio's
/// blocking pool. Returned addresses carry port 0; callers set the port.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Box<str>> for GaiResolver {
    type Response = SocketAddrs;
    type Error = io::Error;
    type Future = GaiFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, host: Box<str>) -> Self::Future {
        let span = tracing::Span::current();
        GaiFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %host).in_scope(|| {
                    tracing::trace!("dns resolution starting");
                    (&*host, 0)
                        .to_socket_addrs()
                        .map(SocketAddrs::from_iter)
                })
            }),
        }
    }
}

/// Future returned by [`GaiResolver`].
///
/// Dropping the future aborts the lookup task.
#[pin_project(PinnedDrop)]
pub struct GaiFuture {
    #[pin]
    handle: JoinHandle<Result<SocketAddrs, io::Error>>,
}

impl fmt::Debug for GaiFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl Future for GaiFuture {
    type Output = Result<SocketAddrs, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(join_err) if join_err.is_cancelled() => {
                Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
            }
            Err(join_err) => Poll::Ready(Err(io::Error::other(join_err))),
        }
    }
}

#[pinned_drop]
impl PinnedDrop for GaiFuture {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use tower::ServiceExt as _;

    use super::*;

    #[test]
    fn filter_by_network() {
        let mut addrs = SocketAddrs::from_iter([
            SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
            SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 0),
        ]);
        addrs.set_port(443);

        let mut v4 = addrs.clone();
        v4.retain_network(Network::Tcp4);
        assert_eq!(
            v4.iter().collect::<Vec<_>>(),
            vec![&SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 443)]
        );

        let mut v6 = addrs.clone();
        v6.retain_network(Network::Tcp6);
        assert_eq!(v6.len(), 1);

        addrs.retain_network(Network::Tcp);
        assert_eq!(addrs.len(), 2);
    }

    #[tokio::test]
    async fn resolve_ip_literal() {
        let addrs = GaiResolver::new()
            .oneshot("127.0.0.1".into())
            .await
            .unwrap();
        assert!(addrs
            .iter()
            .any(|addr| addr.ip() == std::net::IpAddr::from(Ipv4Addr::LOCALHOST)));
    }
}
