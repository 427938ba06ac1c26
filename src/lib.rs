//! tlsdialer
//!
//! Pluggable TLS dial strategies for a mail API client, and the single HTTP
//! transport they plug into.
//!
//! A [`TlsDialer`] decides *how* a TLS connection is opened: straight to the
//! API ([`BasicTlsDialer`]), through an alternate route
//! ([`ProxyTlsDialer`][dial::proxy::ProxyTlsDialer]), or with additional
//! certificate pinning ([`PinningTlsDialer`][dial::pinning::PinningTlsDialer]).
//! [`build_transport`] wraps any of them in a pooled HTTP/1.1 transport whose
//! timeouts and pool limits are the same regardless of strategy.
//!
//! ```no_run
//! use tlsdialer::{build_transport, BasicTlsDialer};
//!
//! # async fn run() -> Result<(), tlsdialer::BoxError> {
//! let transport = build_transport(BasicTlsDialer::new());
//! let request = http::Request::get(tlsdialer::config::API_BASE_URL)
//!     .body(http_body_util::Empty::<bytes::Bytes>::new())?;
//! let response = transport.request(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

#[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
compile_error!("one of the `tls-ring` or `tls-aws-lc` features must be enabled");

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod conn;
pub mod dial;
mod error;
mod pool;
pub mod report;
pub mod transport;

pub use dial::basic::BasicTlsDialer;
pub use dial::{Address, DialError, Network, TlsConnection, TlsDialer};
pub use error::Error;
pub use transport::{build_transport, Transport, TransportConfig};

/// Boxed error type used where the concrete error is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed, sendable future returned by dial strategies.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The rustls crypto provider selected by the enabled cargo features.
pub(crate) fn crypto_provider() -> std::sync::Arc<rustls::crypto::CryptoProvider> {
    #[cfg(feature = "tls-ring")]
    return std::sync::Arc::new(rustls::crypto::ring::default_provider());

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    return std::sync::Arc::new(rustls::crypto::aws_lc_rs::default_provider());
}
