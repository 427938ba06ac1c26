//! The default dial strategy.
//!
//! [`BasicTlsDialer`] connects with a fixed connect timeout, picks a
//! certificate validation mode from its [`VerificationPolicy`], and performs
//! the TLS handshake under a fixed handshake timeout. It holds no mutable
//! state, so one instance can serve any number of concurrent dials.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tower::ServiceExt as _;
use tracing::Instrument as _;

use super::tls::{native_root_store, TlsConfigs};
use super::{
    Address, DialError, Io, Network, TlsConnection, TlsDialer, Verification, VerificationPolicy,
};
use crate::config::{CONNECT_TIMEOUT, TLS_HANDSHAKE_TIMEOUT};
use crate::conn::{PeerAddr, TcpConnector, Target};
use crate::report::{AnomalyKind, TlsReport, TlsReporter};
use crate::BoxFuture;

/// Dials TLS connections directly.
///
/// Full certificate validation applies only to addresses the policy marks as
/// canonical; by default that is exactly [`ROOT_ADDRESS`][crate::config::ROOT_ADDRESS].
/// Every other address is dialed with relaxed validation, and if a reporter is
/// configured, chains that standard validation would reject are reported.
///
/// The connector `C` opens the raw stream. It defaults to [`TcpConnector`].
#[derive(Clone)]
pub struct BasicTlsDialer<C = TcpConnector> {
    connector: C,
    policy: VerificationPolicy,
    tls: TlsConfigs,
    reporter: Option<Arc<dyn TlsReporter>>,
}

impl<C: fmt::Debug> fmt::Debug for BasicTlsDialer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicTlsDialer")
            .field("connector", &self.connector)
            .field("policy", &self.policy)
            .field("reporter", &self.reporter)
            .finish()
    }
}

impl Default for BasicTlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicTlsDialer {
    /// A dialer using TCP, the platform's trusted roots and the default policy.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a dialer.
    pub fn builder() -> Builder<TcpConnector> {
        Builder {
            connector: TcpConnector::new(),
            policy: VerificationPolicy::default(),
            roots: None,
            reporter: None,
        }
    }
}

impl<C> BasicTlsDialer<C> {
    /// The validation policy this dialer applies.
    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }
}

/// Builder for [`BasicTlsDialer`].
#[derive(Debug)]
pub struct Builder<C> {
    connector: C,
    policy: VerificationPolicy,
    roots: Option<RootCertStore>,
    reporter: Option<Arc<dyn TlsReporter>>,
}

impl<C> Builder<C> {
    /// Open raw streams with a different connector.
    pub fn with_connector<C2>(self, connector: C2) -> Builder<C2> {
        Builder {
            connector,
            policy: self.policy,
            roots: self.roots,
            reporter: self.reporter,
        }
    }

    /// Use a different validation policy.
    pub fn with_policy(mut self, policy: VerificationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Trust these roots for full validation instead of the platform's.
    pub fn with_root_store(mut self, roots: RootCertStore) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Report relaxed-validation anomalies to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn TlsReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the dialer.
    pub fn build(self) -> BasicTlsDialer<C> {
        let roots = self.roots.unwrap_or_else(native_root_store);
        BasicTlsDialer {
            connector: self.connector,
            policy: self.policy,
            tls: TlsConfigs::new(roots),
            reporter: self.reporter,
        }
    }
}

impl<C, IO> TlsDialer for BasicTlsDialer<C>
where
    C: tower::Service<Target, Response = IO, Error = DialError>
        + Clone
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    C::Future: Send,
    IO: Io + PeerAddr,
{
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        let address = match Address::parse(address) {
            Ok(address) => address,
            Err(error) => return Box::pin(std::future::ready(Err(error))),
        };

        let verification = self.policy.verification_for(address.as_str());
        let span = tracing::debug_span!("dial", %address, %network, %verification);

        let dial = Dial {
            connector: self.connector.clone(),
            tls: self.tls.clone(),
            reporter: self.reporter.clone(),
            network,
            address,
            verification,
        };

        Box::pin(dial.run().instrument(span))
    }
}

/// The state of a single dial, moved into its future.
struct Dial<C> {
    connector: C,
    tls: TlsConfigs,
    reporter: Option<Arc<dyn TlsReporter>>,
    network: Network,
    address: Address,
    verification: Verification,
}

impl<C, IO> Dial<C>
where
    C: tower::Service<Target, Response = IO, Error = DialError>,
    IO: Io + PeerAddr,
{
    async fn run(self) -> Result<TlsConnection, DialError> {
        let Dial {
            connector,
            tls,
            reporter,
            network,
            address,
            verification,
        } = self;

        let server_name = ServerName::try_from(address.host().to_owned()).map_err(|_| {
            DialError::InvalidAddress {
                address: address.to_string(),
                reason: "host is not a valid server name",
            }
        })?;

        let target = Target::new(network, address.clone());
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, connector.oneshot(target))
            .await
            .map_err(|_| {
                tracing::debug!(timeout = ?CONNECT_TIMEOUT, "connect timed out");
                DialError::ConnectTimeout {
                    address: address.to_string(),
                    timeout: CONNECT_TIMEOUT,
                }
            })??;

        let remote_addr = stream.peer_addr();
        let stream: Box<dyn Io> = Box::new(stream);

        let handshake = TlsConnector::from(tls.config(verification))
            .connect(server_name.clone(), stream)
            .instrument(tracing::trace_span!("handshake"));
        let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                tracing::debug!(error = %source, "tls handshake failed");
                return Err(DialError::Handshake {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => {
                tracing::debug!(timeout = ?TLS_HANDSHAKE_TIMEOUT, "tls handshake timed out");
                return Err(DialError::HandshakeTimeout {
                    address: address.to_string(),
                    timeout: TLS_HANDSHAKE_TIMEOUT,
                });
            }
        };

        let connection = TlsConnection::new(
            stream,
            &address,
            address.host().to_owned(),
            verification,
            remote_addr,
        );
        tracing::trace!(alpn = ?connection.info().alpn, "tls connected");

        if let (Verification::Relaxed, Some(reporter)) = (verification, reporter) {
            if let Some(reason) = tls.standard_rejection(connection.peer_certificates(), &server_name)
            {
                tracing::debug!(%reason, "relaxed handshake accepted an untrusted certificate");
                reporter.report(TlsReport::new(
                    address.as_str(),
                    address.host(),
                    AnomalyKind::UntrustedCertificate { reason },
                    connection.peer_certificates(),
                ));
            }
        }

        Ok(connection)
    }
}
