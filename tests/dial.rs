use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use tlsdialer::config::CONNECT_TIMEOUT;
use tlsdialer::dial::pinning::PinningTlsDialer;
use tlsdialer::dial::proxy::{ProxyController as _, ProxyProvider, ProxyTlsDialer};
use tlsdialer::dial::{Verification, VerificationPolicy};
use tlsdialer::report::fingerprint;
use tlsdialer::{BasicTlsDialer, BoxError, BoxFuture, DialError, Network, TlsDialer};

mod common;

use common::{Blackhole, Routes};

#[tokio::test]
async fn validation_is_full_only_for_the_canonical_address() {
    let _ = tracing_subscriber::fmt::try_init();

    let identity = common::identity("other.example");
    let server = common::https_server(&identity).await;

    let dialer = BasicTlsDialer::builder()
        .with_connector(Routes::new([
            ("root.example:443", server.addr),
            ("proxy.example:443", server.addr),
        ]))
        .with_policy(VerificationPolicy::canonical("root.example:443"))
        .with_root_store(common::root_store(&identity))
        .build();

    let error = dialer
        .dial_tls(Network::Tcp, "root.example:443")
        .await
        .expect_err("mismatched certificate must fail on the canonical address");
    assert!(error.is_handshake(), "{error:?}");
    assert!(!error.is_connect());

    let conn = dialer
        .dial_tls(Network::Tcp, "proxy.example:443")
        .await
        .expect("non-canonical address skips chain and hostname checks");
    assert_eq!(conn.info().verification, Verification::Relaxed);
}

#[tokio::test]
async fn canonical_address_with_trusted_certificate() {
    let identity = common::identity("root.example");
    let server = common::https_server(&identity).await;

    let dialer = BasicTlsDialer::builder()
        .with_connector(Routes::new([("root.example:443", server.addr)]))
        .with_policy(VerificationPolicy::canonical("root.example:443"))
        .with_root_store(common::root_store(&identity))
        .build();

    let conn = dialer
        .dial_tls(Network::Tcp4, "root.example:443")
        .await
        .unwrap();
    assert_eq!(conn.info().verification, Verification::Full);
    assert_eq!(conn.info().alpn.as_deref(), Some("http/1.1"));
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_bounds_every_concurrent_dial() {
    let dialer: Arc<dyn TlsDialer> = Arc::new(
        BasicTlsDialer::builder()
            .with_connector(Blackhole)
            .with_root_store(rustls::RootCertStore::empty())
            .build(),
    );

    let start = Instant::now();
    let dials = (0..16).map(|i| {
        let dialer = dialer.clone();
        tokio::spawn(async move {
            let error = dialer
                .dial_tls(Network::Tcp, &format!("host{i}.example:443"))
                .await
                .unwrap_err();
            (error, start.elapsed())
        })
    });

    for dial in futures_util::future::join_all(dials).await {
        let (error, elapsed) = dial.unwrap();
        assert!(
            matches!(error, DialError::ConnectTimeout { timeout, .. } if timeout == CONNECT_TIMEOUT),
            "{error:?}"
        );
        assert!(error.is_connect());
        assert!(elapsed >= CONNECT_TIMEOUT, "{elapsed:?}");
        assert!(elapsed < CONNECT_TIMEOUT + Duration::from_secs(1), "{elapsed:?}");
    }
}

#[derive(Debug, Default)]
struct FixedRoute {
    calls: AtomicUsize,
}

impl ProxyProvider for FixedRoute {
    fn find_reachable_server(&self) -> BoxFuture<'static, Result<String, BoxError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok("proxy.example:443".to_owned()) })
    }
}

#[tokio::test]
async fn blocked_root_falls_back_to_pinned_alternate_route() {
    let _ = tracing_subscriber::fmt::try_init();

    let identity = common::identity("proxy.example");
    let server = common::https_server(&identity).await;
    let provider = Arc::new(FixedRoute::default());

    let basic = BasicTlsDialer::builder()
        .with_connector(Routes::new([("proxy.example:443", server.addr)]))
        .with_policy(VerificationPolicy::canonical("root.example:443"))
        .with_root_store(rustls::RootCertStore::empty())
        .build();
    let routed = ProxyTlsDialer::new(basic, provider.clone())
        .with_direct_address("root.example:443");
    routed.allow_proxy();
    let dialer = PinningTlsDialer::new(routed.clone(), [fingerprint(&identity.cert)]);

    let conn = dialer
        .dial_tls(Network::Tcp, "root.example:443")
        .await
        .unwrap();
    assert_eq!(conn.info().address, "proxy.example:443");
    assert_eq!(conn.info().verification, Verification::Relaxed);
    assert_eq!(routed.current_route(), "proxy.example:443");

    // The route sticks: the next dial goes straight to the alternate server.
    dialer
        .dial_tls(Network::Tcp, "root.example:443")
        .await
        .unwrap();
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    common::eventually(|| server.connections() == 2).await;

    routed.disallow_proxy();
    let error = dialer
        .dial_tls(Network::Tcp, "root.example:443")
        .await
        .unwrap_err();
    assert!(error.is_connect(), "{error:?}");
}

#[test]
fn strategies_are_interchangeable() {
    let basic = || {
        BasicTlsDialer::builder()
            .with_connector(Blackhole)
            .with_root_store(rustls::RootCertStore::empty())
            .build()
    };

    let strategies: Vec<Box<dyn TlsDialer>> = vec![
        Box::new(basic()),
        Box::new(ProxyTlsDialer::new(basic(), Arc::new(FixedRoute::default()))),
        Box::new(PinningTlsDialer::new(basic(), ["pin"])),
    ];

    let names: Vec<String> = strategies
        .iter()
        .map(|strategy| format!("{strategy:?}"))
        .collect();
    assert!(names[0].starts_with("BasicTlsDialer"));
    assert!(names[1].starts_with("ProxyTlsDialer"));
    assert!(names[2].starts_with("PinningTlsDialer"));
}
