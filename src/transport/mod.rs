//! The HTTP transport every dial strategy plugs into.
//!
//! [`build_transport`] is the only place transport tuning is decided. Whatever
//! strategy it is given, the resulting [`Transport`] has the same idle pool
//! limits, expect-continue wait and response-header timeout, all taken from
//! [`crate::config`]. Every `https` connection it opens comes from the
//! strategy; `http` requests use plain TCP, optionally through the
//! environment's forward proxy.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, EXPECT, HOST};
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use tower::ServiceExt as _;
use tracing::Instrument as _;

use crate::config::{
    CONNECT_TIMEOUT, EXPECT_CONTINUE_TIMEOUT, IDLE_CONNECTION_TIMEOUT, MAX_IDLE_CONNECTIONS,
    RESPONSE_HEADER_TIMEOUT, TLS_HANDSHAKE_TIMEOUT,
};
use crate::conn::{TcpConnector, Target};
use crate::dial::{Address, DialError, Io, Network, TlsDialer};
use crate::error::Error;
use crate::pool::{self, Pool, PoolKey};
use crate::{BoxError, BoxFuture};

mod body;
mod proxy;

use self::body::Outgoing;
pub use self::proxy::ProxyRule;

/// Tuning for a [`Transport`].
///
/// The [`Default`] is the tuned configuration [`build_transport`] uses.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TransportConfig {
    /// Idle connections kept across all hosts.
    pub max_idle_connections: usize,

    /// How long a connection may sit idle before it is closed.
    pub idle_timeout: Duration,

    /// How long a request with `Expect: 100-continue` holds its body.
    ///
    /// This is a fixed delay, not a maximum: an early `100 Continue` from the
    /// server does not release the body sooner.
    pub expect_continue_timeout: Duration,

    /// How long to wait for response headers once the request body has been
    /// written.
    pub response_header_timeout: Duration,

    /// The dial strategy's handshake allowance, part of the dial budget.
    pub tls_handshake_timeout: Duration,

    /// The dial strategy's connect allowance, and the plain TCP connect timeout.
    pub connect_timeout: Duration,

    /// Forward proxy selection for `http` requests.
    pub proxy: ProxyRule,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: MAX_IDLE_CONNECTIONS,
            idle_timeout: IDLE_CONNECTION_TIMEOUT,
            expect_continue_timeout: EXPECT_CONTINUE_TIMEOUT,
            response_header_timeout: RESPONSE_HEADER_TIMEOUT,
            tls_handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            proxy: ProxyRule::from_env(),
        }
    }
}

impl TransportConfig {
    /// Total time a single strategy call may take.
    pub fn dial_budget(&self) -> Duration {
        self.connect_timeout + self.tls_handshake_timeout
    }
}

/// Build the transport for `dialer` with the tuned configuration.
///
/// This never fails, and holds no per-request state: the result is safe to
/// clone and share across tasks.
pub fn build_transport<D: TlsDialer>(dialer: D) -> Transport {
    Transport::with_config(dialer, TransportConfig::default())
}

type Connection = SendRequest<Outgoing>;

/// A pooled HTTP/1.1 transport.
#[derive(Clone)]
pub struct Transport {
    dialer: Arc<dyn TlsDialer>,
    tcp: TcpConnector,
    config: Arc<TransportConfig>,
    pool: Pool<Connection>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("dialer", &self.dialer)
            .field("config", &self.config)
            .finish()
    }
}

impl Transport {
    /// Build a transport for `dialer` with a custom configuration.
    pub fn with_config<D: TlsDialer>(dialer: D, config: TransportConfig) -> Self {
        let pool = Pool::new(pool::Config {
            idle_timeout: Some(config.idle_timeout).filter(|timeout| !timeout.is_zero()),
            max_idle: config.max_idle_connections,
        });

        Self {
            dialer: Arc::new(dialer),
            tcp: TcpConnector::new(),
            config: Arc::new(config),
            pool,
        }
    }

    /// The configuration this transport was built with.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Number of idle connections currently pooled.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_count()
    }

    /// Send a request and wait for the response headers.
    ///
    /// The connection returns to the pool once the response body has been
    /// read to the end.
    pub async fn request<B>(&self, request: Request<B>) -> Result<Response<Incoming>, Error>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (mut parts, body) = request.into_parts();
        let destination = Destination::new(&parts.uri, &self.config.proxy)?;
        let span = tracing::debug_span!("request", method = %parts.method, key = %destination.key);

        async move {
            prepare(&mut parts, &destination)?;

            let hold = expects_continue(&parts).then_some(self.config.expect_continue_timeout);
            let (body, sent) = Outgoing::new(body, hold);
            let request = Request::from_parts(parts, body);

            let mut conn = match self.pool.checkout(&destination.key) {
                Some(conn) => conn,
                None => self.connect(&destination).await?,
            };

            // The header timer starts once the whole body has been written.
            let timeout = self.config.response_header_timeout;
            let response = {
                let send = conn.send_request(request);
                let deadline = async {
                    sent.await;
                    tokio::time::sleep(timeout).await;
                };
                tokio::pin!(send, deadline);

                tokio::select! {
                    response = &mut send => response?,
                    () = &mut deadline => {
                        tracing::debug!(?timeout, "response header timeout");
                        return Err(Error::ResponseHeaderTimeout(timeout));
                    }
                }
            };

            let pool = self.pool.clone();
            let key = destination.key;
            tokio::spawn(async move {
                if conn.ready().await.is_ok() {
                    pool.checkin(key, conn);
                }
            });

            Ok(response)
        }
        .instrument(span)
        .await
    }

    async fn connect(&self, destination: &Destination) -> Result<Connection, Error> {
        if destination.secure {
            let budget = self.config.dial_budget();
            let address = destination.address.as_str();
            tracing::trace!(%address, "dialing through strategy");
            let stream = tokio::time::timeout(budget, self.dialer.dial_tls(Network::Tcp, address))
                .await
                .map_err(|_| Error::DialTimeout(budget))??;
            return handshake(stream).await;
        }

        let address = match &destination.proxy {
            Some(proxy) => proxy.clone(),
            None => destination.address.clone(),
        };
        let timeout = self.config.connect_timeout;
        let target = Target::new(Network::Tcp, address.clone());
        let stream = tokio::time::timeout(timeout, self.tcp.clone().oneshot(target))
            .await
            .map_err(|_| {
                Error::Connect(
                    DialError::ConnectTimeout {
                        address: address.to_string(),
                        timeout,
                    }
                    .into(),
                )
            })?
            .map_err(|error| Error::Connect(error.into()))?;
        handshake(stream).await
    }
}

async fn handshake<IO: Io>(stream: IO) -> Result<Connection, Error> {
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(
        async move {
            if let Err(error) = conn.await {
                tracing::debug!(%error, "connection closed with error");
            }
        }
        .in_current_span(),
    );
    Ok(sender)
}

impl<B> tower::Service<Request<B>> for Transport
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<Incoming>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response<Incoming>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let transport = self.clone();
        Box::pin(async move { transport.request(request).await })
    }
}

/// Where a request goes, and through which connection.
#[derive(Debug)]
struct Destination {
    key: PoolKey,
    authority: Authority,
    address: Address,
    proxy: Option<Address>,
    secure: bool,
}

impl Destination {
    fn new(uri: &Uri, rule: &ProxyRule) -> Result<Self, Error> {
        let scheme = uri.scheme().ok_or(Error::InvalidUri("missing scheme"))?;
        let authority = uri.authority().ok_or(Error::InvalidUri("missing host"))?;

        let secure = if *scheme == Scheme::HTTPS {
            true
        } else if *scheme == Scheme::HTTP {
            false
        } else {
            return Err(Error::UnsupportedScheme(scheme.to_string()));
        };

        let port = authority.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let address = Address::parse(&format!("{}:{port}", authority.host()))?;
        let dialed = Authority::try_from(address.as_str())
            .map_err(|_| Error::InvalidUri("invalid authority"))?;

        let proxy = if secure {
            None
        } else {
            rule.proxy_for(scheme, authority.host())
                .and_then(Uri::authority)
        };
        let proxy_address = proxy
            .map(|proxy| {
                let port = proxy.port_u16().unwrap_or(80);
                Address::parse(&format!("{}:{port}", proxy.host()))
            })
            .transpose()?;

        let key = PoolKey::new(scheme.clone(), dialed, proxy.cloned());

        Ok(Self {
            key,
            authority: authority.clone(),
            address,
            proxy: proxy_address,
            secure,
        })
    }
}

/// Fill in `Host` and pick the request target form.
fn prepare(parts: &mut http::request::Parts, destination: &Destination) -> Result<(), Error> {
    if !parts.headers.contains_key(HOST) {
        let host = HeaderValue::from_str(destination.authority.as_str())
            .map_err(|_| Error::InvalidUri("invalid authority"))?;
        parts.headers.insert(HOST, host);
    }

    if destination.proxy.is_none() {
        let path = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::from(path);
    }

    Ok(())
}

fn expects_continue(parts: &http::request::Parts) -> bool {
    parts
        .headers
        .get(EXPECT)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"100-continue"))
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Transport: Clone, Send, Sync);
    assert_impl_all!(TransportConfig: Send, Sync);

    fn parts(uri: &str) -> http::request::Parts {
        Request::get(uri).body(()).unwrap().into_parts().0
    }

    #[test]
    fn default_config_uses_tuned_constants() {
        let config = TransportConfig::default();
        assert_eq!(config.max_idle_connections, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.expect_continue_timeout, Duration::from_millis(500));
        assert_eq!(config.response_header_timeout, Duration::from_secs(30));
        assert_eq!(config.tls_handshake_timeout, config.response_header_timeout);
        assert_eq!(config.dial_budget(), Duration::from_secs(40));
    }

    #[test]
    fn https_destination() {
        let uri: Uri = "https://api.example/v4/users?x=1".parse().unwrap();
        let destination = Destination::new(&uri, &ProxyRule::none()).unwrap();
        assert!(destination.secure);
        assert_eq!(destination.address.as_str(), "api.example:443");
        assert_eq!(destination.key.to_string(), "https://api.example:443");

        let mut parts = parts("https://api.example/v4/users?x=1");
        prepare(&mut parts, &destination).unwrap();
        assert_eq!(parts.uri, "/v4/users?x=1");
        assert_eq!(parts.headers[HOST], "api.example");
    }

    #[test]
    fn https_ignores_http_proxy() {
        let rule = ProxyRule::none()
            .with_http_proxy("http://proxy.local:3128")
            .with_https_proxy("http://proxy.local:3128");
        let uri: Uri = "https://api.example:8443/".parse().unwrap();
        let destination = Destination::new(&uri, &rule).unwrap();
        assert!(destination.proxy.is_none());
        assert_eq!(destination.address.as_str(), "api.example:8443");
    }

    #[test]
    fn http_through_proxy_keeps_absolute_form() {
        let rule = ProxyRule::none().with_http_proxy("http://proxy.local:3128");
        let uri: Uri = "http://plain.example/status".parse().unwrap();
        let destination = Destination::new(&uri, &rule).unwrap();
        assert_eq!(
            destination.proxy.as_ref().map(Address::as_str),
            Some("proxy.local:3128")
        );
        assert_eq!(
            destination.key.to_string(),
            "http://plain.example:80 via proxy.local:3128"
        );

        let mut parts = parts("http://plain.example/status");
        prepare(&mut parts, &destination).unwrap();
        assert_eq!(parts.uri, "http://plain.example/status");
    }

    #[test]
    fn default_port_shares_pool_key() {
        let rule = ProxyRule::none();
        let implicit = Destination::new(&"https://api.example/a".parse().unwrap(), &rule).unwrap();
        let explicit =
            Destination::new(&"https://api.example:443/b".parse().unwrap(), &rule).unwrap();
        assert_eq!(implicit.key, explicit.key);

        let other = Destination::new(&"https://api.example:8443/".parse().unwrap(), &rule).unwrap();
        assert_ne!(implicit.key, other.key);
    }

    #[test]
    fn explicit_host_header_is_kept() {
        let uri: Uri = "https://api.example/".parse().unwrap();
        let destination = Destination::new(&uri, &ProxyRule::none()).unwrap();
        let mut parts = parts("https://api.example/");
        parts
            .headers
            .insert(HOST, HeaderValue::from_static("other.example"));
        prepare(&mut parts, &destination).unwrap();
        assert_eq!(parts.headers[HOST], "other.example");
    }

    #[test]
    fn rejects_unusable_uris() {
        let rule = ProxyRule::none();
        assert!(matches!(
            Destination::new(&"/relative".parse().unwrap(), &rule),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            Destination::new(&"ftp://files.example/".parse().unwrap(), &rule),
            Err(Error::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    #[test]
    fn expect_continue_detection() {
        let mut parts = parts("https://api.example/");
        assert!(!expects_continue(&parts));
        parts
            .headers
            .insert(EXPECT, HeaderValue::from_static("100-Continue"));
        assert!(expects_continue(&parts));
    }
}
