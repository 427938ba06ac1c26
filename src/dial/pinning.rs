//! Certificate pinning on top of another strategy.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::Instrument as _;

use super::{DialError, Network, TlsConnection, TlsDialer};
use crate::report::{fingerprint, AnomalyKind, TlsReport, TlsReporter};
use crate::BoxFuture;

/// Accepts a connection only if its peer presents a pinned certificate.
///
/// Pins are base64-encoded SHA-256 digests of DER certificates, as produced by
/// [`fingerprint`]. A connection passes when any certificate in the presented
/// chain matches any pin. On a mismatch the connection is dropped, the
/// reporter (if any) receives an [`AnomalyKind::PinMismatch`] report, and the
/// dial fails with [`DialError::Rejected`].
///
/// Pinning is what gives relaxed-validation dials an identity check.
pub struct PinningTlsDialer<D> {
    dialer: Arc<D>,
    pins: Arc<HashSet<String>>,
    reporter: Option<Arc<dyn TlsReporter>>,
}

impl<D> Clone for PinningTlsDialer<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            pins: self.pins.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for PinningTlsDialer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningTlsDialer")
            .field("dialer", &self.dialer)
            .field("pins", &self.pins.len())
            .finish()
    }
}

impl<D> PinningTlsDialer<D> {
    /// Wrap `dialer`, requiring one of `pins`.
    pub fn new<I, S>(dialer: D, pins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dialer: Arc::new(dialer),
            pins: Arc::new(pins.into_iter().map(Into::into).collect()),
            reporter: None,
        }
    }

    /// Report pin mismatches to `reporter`.
    pub fn with_reporter(mut self, reporter: Arc<dyn TlsReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }
}

impl<D: TlsDialer> TlsDialer for PinningTlsDialer<D> {
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        let dial = self.dialer.dial_tls(network, address);
        let pins = self.pins.clone();
        let reporter = self.reporter.clone();
        let span = tracing::debug_span!("pinning", %address);

        Box::pin(
            async move {
                let conn = dial.await?;
                let chain = conn.peer_certificates();
                if chain.iter().any(|cert| pins.contains(&fingerprint(cert))) {
                    return Ok(conn);
                }

                let info = conn.info();
                tracing::warn!(server_name = %info.server_name, "no pinned certificate presented");
                if let Some(reporter) = reporter {
                    reporter.report(TlsReport::new(
                        info.address.as_str(),
                        info.server_name.as_str(),
                        AnomalyKind::PinMismatch,
                        chain,
                    ));
                }

                Err(DialError::Rejected {
                    address: info.address.clone(),
                    reason: "no pinned certificate in chain".into(),
                })
            }
            .instrument(span),
        )
    }
}
