//! HTTP `CONNECT` tunnels through a forward proxy.
//!
//! [`TunnelConnector`] makes any dial strategy proxy-aware: give it to
//! [`BasicTlsDialer::builder`][crate::BasicTlsDialer::builder] and TLS is
//! negotiated end to end through the tunnel, so certificate validation still
//! sees the origin's certificate.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::Scheme;
use http_body_util::Empty;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tower::ServiceExt as _;
use tracing::Instrument as _;

use super::{PeerAddr, TcpConnector, Target};
use crate::dial::{Address, DialError, Io};
use crate::transport::ProxyRule;
use crate::BoxFuture;

/// A connection that is either direct or tunneled through a proxy.
#[derive(Debug)]
pub enum MaybeTunnel<IO> {
    /// No proxy applied to the target.
    Direct(IO),

    /// Bytes flow through an HTTP `CONNECT` tunnel.
    Tunnel {
        /// The upgraded proxy connection.
        io: TokioIo<Upgraded>,
        /// The proxy's socket address.
        proxy_addr: Option<SocketAddr>,
    },
}

impl<IO: PeerAddr> PeerAddr for MaybeTunnel<IO> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            MaybeTunnel::Direct(io) => io.peer_addr(),
            MaybeTunnel::Tunnel { proxy_addr, .. } => *proxy_addr,
        }
    }
}

impl<IO: AsyncRead + Unpin> AsyncRead for MaybeTunnel<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTunnel::Direct(io) => Pin::new(io).poll_read(cx, buf),
            MaybeTunnel::Tunnel { io, .. } => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl<IO: AsyncWrite + Unpin> AsyncWrite for MaybeTunnel<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTunnel::Direct(io) => Pin::new(io).poll_write(cx, buf),
            MaybeTunnel::Tunnel { io, .. } => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTunnel::Direct(io) => Pin::new(io).poll_flush(cx),
            MaybeTunnel::Tunnel { io, .. } => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTunnel::Direct(io) => Pin::new(io).poll_shutdown(cx),
            MaybeTunnel::Tunnel { io, .. } => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// Opens connections through the `https` proxy of a [`ProxyRule`].
///
/// Targets the rule does not proxy (no `https` proxy configured, or the host
/// is listed in `NO_PROXY`) are connected directly with the inner connector.
#[derive(Debug, Clone)]
pub struct TunnelConnector<C = TcpConnector> {
    inner: C,
    rule: Arc<ProxyRule>,
}

impl TunnelConnector {
    /// Tunnel through the proxy named by `HTTPS_PROXY`, if any.
    pub fn from_env() -> Self {
        Self::new(ProxyRule::from_env())
    }

    /// Tunnel according to `rule`, connecting over TCP.
    pub fn new(rule: ProxyRule) -> Self {
        Self {
            inner: TcpConnector::new(),
            rule: Arc::new(rule),
        }
    }
}

impl<C> TunnelConnector<C> {
    /// Connect to targets and proxies with a different connector.
    pub fn with_connector<C2>(self, inner: C2) -> TunnelConnector<C2> {
        TunnelConnector {
            inner,
            rule: self.rule,
        }
    }
}

impl<C, IO> tower::Service<Target> for TunnelConnector<C>
where
    C: tower::Service<Target, Response = IO, Error = DialError> + Clone + Send + 'static,
    C::Future: Send,
    IO: Io + PeerAddr,
{
    type Response = MaybeTunnel<IO>;
    type Error = DialError;
    type Future = BoxFuture<'static, Result<MaybeTunnel<IO>, DialError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let inner = self.inner.clone();
        let proxy = self
            .rule
            .proxy_for(&Scheme::HTTPS, target.address.host())
            .and_then(|uri| uri.authority())
            .map(|authority| {
                let port = authority.port_u16().unwrap_or(80);
                Address::parse(&format!("{}:{port}", authority.host()))
            });

        match proxy {
            None => Box::pin(async move { inner.oneshot(target).await.map(MaybeTunnel::Direct) }),
            Some(Err(error)) => Box::pin(std::future::ready(Err(error))),
            Some(Ok(proxy)) => {
                let span = tracing::debug_span!("tunnel", %proxy, address = %target.address);
                Box::pin(tunnel(inner, proxy, target).instrument(span))
            }
        }
    }
}

async fn tunnel<C, IO>(
    inner: C,
    proxy: Address,
    target: Target,
) -> Result<MaybeTunnel<IO>, DialError>
where
    C: tower::Service<Target, Response = IO, Error = DialError>,
    IO: Io + PeerAddr,
{
    let stream = inner.oneshot(Target::new(target.network, proxy)).await?;
    let proxy_addr = stream.peer_addr();

    let failed = |error: io::Error| DialError::Connect {
        address: target.address.to_string(),
        source: error,
    };

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|error| failed(io::Error::other(error)))?;
    tokio::spawn(async move {
        if let Err(error) = conn.with_upgrades().await {
            tracing::debug!(%error, "proxy connection error");
        }
    });

    let authority = target.address.as_str();
    let request = http::Request::connect(authority)
        .header(http::header::HOST, authority)
        .body(Empty::<Bytes>::new())
        .map_err(|error| failed(io::Error::new(io::ErrorKind::InvalidInput, error)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|error| failed(io::Error::other(error)))?;

    if !response.status().is_success() {
        tracing::debug!(status = %response.status(), "proxy refused tunnel");
        return Err(failed(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy responded {}", response.status()),
        )));
    }

    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|error| failed(io::Error::other(error)))?;
    tracing::trace!("tunnel established");

    Ok(MaybeTunnel::Tunnel {
        io: TokioIo::new(upgraded),
        proxy_addr,
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::dial::{Network, TlsDialer, Verification, VerificationPolicy};
    use crate::fixtures;
    use crate::BasicTlsDialer;

    /// A forward proxy that answers one `CONNECT` with `status` and, on
    /// success, splices the client to `upstream`.
    async fn proxy(
        status: &'static str,
        upstream: SocketAddr,
    ) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut client, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = client.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending request head");
                head.extend_from_slice(&buf[..n]);
            }

            client
                .write_all(format!("HTTP/1.1 {status}\r\n\r\n").as_bytes())
                .await
                .unwrap();
            if status.starts_with("200") {
                let mut server = TcpStream::connect(upstream).await.unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut server).await;
            }
            String::from_utf8(head).unwrap()
        });
        (addr, handle)
    }

    fn dialer(rule: ProxyRule, trusted: &fixtures::Identity) -> BasicTlsDialer<TunnelConnector> {
        BasicTlsDialer::builder()
            .with_connector(TunnelConnector::new(rule))
            .with_policy(VerificationPolicy::canonical("localhost:443"))
            .with_root_store(fixtures::root_store(trusted))
            .build()
    }

    #[tokio::test]
    async fn tls_through_tunnel_validates_origin() {
        let _ = tracing_subscriber::fmt::try_init();

        let identity = fixtures::identity("localhost");
        let origin = fixtures::echo_server(&identity).await;
        let (proxy_addr, head) = proxy("200 Connection Established", origin).await;

        let rule = ProxyRule::none().with_https_proxy(&format!("http://{proxy_addr}"));
        let mut conn = dialer(rule, &identity)
            .dial_tls(Network::Tcp, "localhost:443")
            .await
            .unwrap();
        assert_eq!(conn.info().verification, Verification::Full);
        assert_eq!(conn.info().remote_addr, Some(proxy_addr));

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(conn);

        let head = head.await.unwrap();
        assert!(head.starts_with("CONNECT localhost:443 HTTP/1.1\r\n"), "{head}");
        assert!(head.to_ascii_lowercase().contains("host: localhost:443\r\n"));
    }

    #[tokio::test]
    async fn refused_tunnel_is_a_connect_error() {
        let identity = fixtures::identity("localhost");
        let origin = fixtures::echo_server(&identity).await;
        let (proxy_addr, _) = proxy("407 Proxy Authentication Required", origin).await;

        let rule = ProxyRule::none().with_https_proxy(&format!("http://{proxy_addr}"));
        let error = dialer(rule, &identity)
            .dial_tls(Network::Tcp, "localhost:443")
            .await
            .unwrap_err();
        assert!(matches!(error, DialError::Connect { .. }), "{error:?}");
        assert!(error.to_string().contains("407"), "{error}");
    }

    #[tokio::test]
    async fn no_proxy_connects_directly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = TunnelConnector::new(
            ProxyRule::none()
                .with_https_proxy("http://proxy.invalid:3128")
                .with_no_proxy("127.0.0.1"),
        );
        let target = Target::new(
            Network::Tcp,
            Address::parse(&format!("127.0.0.1:{port}")).unwrap(),
        );
        let (stream, _) = tokio::join!(connector.oneshot(target), listener.accept());
        assert!(matches!(stream.unwrap(), MaybeTunnel::Direct(_)));
    }
}
