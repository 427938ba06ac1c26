//! rustls client configurations for each [`Verification`] mode.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use super::Verification;

/// Load the platform's trusted roots.
///
/// Certificates that fail to load are skipped with a warning.
pub(crate) fn native_root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "failed to load native root certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded native root certificates");
    roots
}

/// One client configuration per verification mode, built once per dialer.
#[derive(Debug, Clone)]
pub(crate) struct TlsConfigs {
    full: Arc<ClientConfig>,
    relaxed: Arc<ClientConfig>,

    /// Standard verifier used to spot untrusted certificates on relaxed dials.
    ///
    /// `None` when the root store is empty.
    standard: Option<Arc<WebPkiServerVerifier>>,
}

impl TlsConfigs {
    pub(crate) fn new(roots: RootCertStore) -> Self {
        let provider = crate::crypto_provider();
        let roots = Arc::new(roots);

        let standard = match WebPkiServerVerifier::builder_with_provider(
            roots.clone(),
            provider.clone(),
        )
        .build()
        {
            Ok(verifier) => Some(verifier),
            Err(error) => {
                tracing::warn!(%error, "standard certificate verifier unavailable");
                None
            }
        };

        let mut full = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .expect("default crypto provider supports the default protocol versions")
            .with_root_certificates(roots)
            .with_no_client_auth();
        full.alpn_protocols.push(b"http/1.1".to_vec());

        let mut relaxed = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .expect("default crypto provider supports the default protocol versions")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RelaxedVerifier { provider }))
            .with_no_client_auth();
        relaxed.alpn_protocols.push(b"http/1.1".to_vec());

        Self {
            full: Arc::new(full),
            relaxed: Arc::new(relaxed),
            standard,
        }
    }

    pub(crate) fn config(&self, verification: Verification) -> Arc<ClientConfig> {
        match verification {
            Verification::Full => self.full.clone(),
            Verification::Relaxed => self.relaxed.clone(),
        }
    }

    /// Run the standard chain and hostname checks against a chain that was
    /// accepted under relaxed validation.
    ///
    /// Returns the reason the chain would have been rejected, if any.
    pub(crate) fn standard_rejection(
        &self,
        chain: &[CertificateDer<'static>],
        server_name: &ServerName<'static>,
    ) -> Option<String> {
        let verifier = self.standard.as_ref()?;
        let Some((end_entity, intermediates)) = chain.split_first() else {
            return Some("no certificate presented".into());
        };

        verifier
            .verify_server_cert(end_entity, intermediates, server_name, &[], UnixTime::now())
            .err()
            .map(|error| error.to_string())
    }
}

/// Accepts any certificate chain for any name.
///
/// Handshake signatures are still verified with the provider's algorithms, so
/// the peer must hold the private key for the certificate it presents.
#[derive(Debug)]
struct RelaxedVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for RelaxedVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
