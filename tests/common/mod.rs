#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use tlsdialer::conn::Target;
use tlsdialer::{BoxFuture, DialError, Network, TlsConnection, TlsDialer};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct Identity {
    pub cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

pub fn identity(name: &str) -> Identity {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![name.to_owned()]).unwrap();
    Identity {
        cert: cert.der().clone(),
        key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
    }
}

pub fn root_store(identity: &Identity) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(identity.cert.clone()).unwrap();
    roots
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    #[cfg(feature = "tls-ring")]
    return Arc::new(rustls::crypto::ring::default_provider());

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return Arc::new(rustls::crypto::aws_lc_rs::default_provider());
}

fn tls_config(identity: &Identity) -> ServerConfig {
    let mut cfg = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert.clone()], identity.key.clone_key())
        .unwrap();
    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

/// A running HTTPS test server.
pub struct Server {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
}

impl Server {
    /// TLS connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// TLS connections the client has not closed yet.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Echoes the request body. The response carries the request's `Host` header
/// and target in `x-host` and `x-target`. `/slow` never answers.
async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() == "/slow" {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }

    let host = req.headers().get(http::header::HOST).cloned();
    let target = req.uri().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|body| body.to_bytes())
        .unwrap_or_default();

    let mut response = Response::new(Full::new(body));
    if let Some(host) = host {
        response.headers_mut().insert("x-host", host);
    }
    response
        .headers_mut()
        .insert("x-target", target.parse().unwrap());
    Ok(response)
}

pub async fn https_server(identity: &Identity) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(tls_config(identity)));
    let connections = Arc::new(AtomicUsize::new(0));
    let open = Arc::new(AtomicUsize::new(0));

    let (counter, live) = (connections.clone(), open.clone());
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let acceptor = acceptor.clone();
            let (counter, live) = (counter.clone(), live.clone());
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                live.fetch_add(1, Ordering::SeqCst);
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper::service::service_fn(echo))
                    .await;
                live.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });

    Server {
        addr,
        connections,
        open,
    }
}

/// Sends each address to a fixed local socket; unknown addresses are refused.
#[derive(Debug, Clone, Default)]
pub struct Routes(Arc<HashMap<String, SocketAddr>>);

impl Routes {
    pub fn new<'a>(routes: impl IntoIterator<Item = (&'a str, SocketAddr)>) -> Self {
        Self(Arc::new(
            routes
                .into_iter()
                .map(|(address, addr)| (address.to_owned(), addr))
                .collect(),
        ))
    }
}

impl tower::Service<Target> for Routes {
    type Response = TcpStream;
    type Error = DialError;
    type Future = BoxFuture<'static, Result<TcpStream, DialError>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), DialError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, target: Target) -> Self::Future {
        let addr = self.0.get(target.address.as_str()).copied();
        Box::pin(async move {
            let address = target.address.to_string();
            let Some(addr) = addr else {
                return Err(DialError::Connect {
                    address,
                    source: io::ErrorKind::ConnectionRefused.into(),
                });
            };
            TcpStream::connect(addr)
                .await
                .map_err(|source| DialError::Connect { address, source })
        })
    }
}

/// A connector whose connections never complete.
#[derive(Debug, Clone)]
pub struct Blackhole;

impl tower::Service<Target> for Blackhole {
    type Response = TcpStream;
    type Error = DialError;
    type Future = std::future::Pending<Result<TcpStream, DialError>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), DialError>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Target) -> Self::Future {
        std::future::pending()
    }
}

/// Every `(network, address)` a [`Recording`] dialer was asked for.
pub type Recorded = Arc<Mutex<Vec<(Network, String)>>>;

/// Records the address of every dial before handing it to the inner strategy.
#[derive(Debug)]
pub struct Recording<D> {
    inner: D,
    dialed: Recorded,
}

impl<D> Recording<D> {
    pub fn new(inner: D) -> (Self, Recorded) {
        let dialed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                dialed: dialed.clone(),
            },
            dialed,
        )
    }
}

impl<D: TlsDialer> TlsDialer for Recording<D> {
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        self.dialed
            .lock()
            .unwrap()
            .push((network, address.to_owned()));
        self.inner.dial_tls(network, address)
    }
}

/// Wait until `condition` holds, failing the test after a few seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
