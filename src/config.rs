//! Tuned constants shared by every dial strategy and transport.
//!
//! These are compile-time values rather than runtime flags.
//! [`TransportConfig`][crate::TransportConfig] defaults to them.

use std::time::Duration;

/// The base URL of the mail API.
pub const API_BASE_URL: &str = "https://api.protonmail.ch";

/// The canonical root address: the `host:port` that [`API_BASE_URL`] dials.
///
/// Only dials to exactly this string get full certificate validation under the
/// default [`VerificationPolicy`][crate::dial::policy::VerificationPolicy].
/// It must stay identical to [`root_address_for`]`(API_BASE_URL)`, otherwise the
/// relaxed policy silently applies to the real API.
pub const ROOT_ADDRESS: &str = "api.protonmail.ch:443";

/// Time allowed for the raw TCP connection to be established.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for the TLS handshake once the TCP connection is up.
///
/// Kept equal to [`RESPONSE_HEADER_TIMEOUT`].
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed between sending a request and receiving its response headers.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum time a request body is held back waiting for `100 Continue`.
pub const EXPECT_CONTINUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Idle connections older than this are closed and never reused.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Maximum number of idle connections kept across all hosts.
pub const MAX_IDLE_CONNECTIONS: usize = 100;

/// TCP keep-alive interval applied to raw connections.
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(15);

/// How long an alternate route stays in use before dials go direct again.
pub const PROXY_USE_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Compute the `host:port` address a URL dials, filling in the scheme's
/// default port.
///
/// Returns `None` when the URL has no host, or no port and a scheme other than
/// `http` or `https`.
pub fn root_address_for(url: &str) -> Option<String> {
    let uri: http::Uri = url.parse().ok()?;
    let host = uri.host()?;
    let port = match uri.port_u16() {
        Some(port) => port,
        None => match uri.scheme_str() {
            Some("http") => 80,
            Some("https") => 443,
            _ => return None,
        },
    };

    Some(format!("{host}:{port}"))
}
