//! Reporting of unexpected TLS certificates.
//!
//! Dial strategies may tell a [`TlsReporter`] when a peer presents a
//! certificate that would not pass standard validation, or that does not match
//! a pin. Reporting is fire-and-forget: [`TlsReporter::report`] cannot fail and
//! must return quickly, and no dial waits on it.

use std::fmt;
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

/// What was unexpected about a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnomalyKind {
    /// The chain was accepted under relaxed validation but would have been
    /// rejected by standard chain and hostname validation.
    UntrustedCertificate {
        /// Why standard validation would have rejected it.
        reason: String,
    },

    /// No certificate in the chain matched any configured pin.
    PinMismatch,
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::UntrustedCertificate { reason } => {
                write!(f, "untrusted certificate: {reason}")
            }
            AnomalyKind::PinMismatch => f.write_str("certificate pin mismatch"),
        }
    }
}

/// A single TLS anomaly.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TlsReport {
    /// The address that was dialed.
    pub address: String,

    /// The server name the certificate was checked against.
    pub server_name: String,

    /// What was unexpected.
    pub kind: AnomalyKind,

    /// [`fingerprint`]s of the presented chain, leaf first.
    pub fingerprints: Vec<String>,

    /// When the anomaly was observed.
    pub observed_at: SystemTime,
}

impl TlsReport {
    /// Build a report for the chain presented by the peer at `address`.
    pub fn new(
        address: impl Into<String>,
        server_name: impl Into<String>,
        kind: AnomalyKind,
        chain: &[CertificateDer<'_>],
    ) -> Self {
        Self {
            address: address.into(),
            server_name: server_name.into(),
            kind,
            fingerprints: chain.iter().map(fingerprint).collect(),
            observed_at: SystemTime::now(),
        }
    }
}

/// Base64-encoded SHA-256 digest of a DER certificate.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    STANDARD.encode(Sha256::digest(cert.as_ref()))
}

/// Receives TLS anomaly reports.
///
/// Implementations must not block; hand the report off to another task if
/// handling it takes time.
pub trait TlsReporter: fmt::Debug + Send + Sync + 'static {
    /// Record an anomaly.
    fn report(&self, report: TlsReport);
}

/// Logs every report at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl TlsReporter for LogReporter {
    fn report(&self, report: TlsReport) {
        tracing::warn!(
            address = %report.address,
            server_name = %report.server_name,
            fingerprint = report.fingerprints.first().map(String::as_str).unwrap_or(""),
            "{}",
            report.kind
        );
    }
}

/// Forwards reports over a bounded channel.
///
/// When the channel is full the report is dropped rather than waiting.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<TlsReport>,
}

impl ChannelReporter {
    /// Create a reporter and the receiver its reports arrive on.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TlsReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl TlsReporter for ChannelReporter {
    fn report(&self, report: TlsReport) {
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                tracing::debug!(address = %report.address, "tls report dropped, channel full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("tls report dropped, receiver closed");
            }
        }
    }
}
