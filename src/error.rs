use std::time::Duration;

use thiserror::Error;

use crate::dial::DialError;
use crate::BoxError;

/// Transport error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The request URI has no host, or is otherwise unusable.
    #[error("invalid uri: {0}")]
    InvalidUri(&'static str),

    /// Only `http` and `https` requests can be sent.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The dial strategy failed to open a connection.
    #[error("dial: {0}")]
    Dial(#[from] DialError),

    /// A plain TCP connection could not be opened.
    #[error("connect: {0}")]
    Connect(#[source] BoxError),

    /// The dial strategy did not finish within the transport's dial budget.
    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    /// The HTTP/1.1 exchange failed.
    #[error("protocol: {0}")]
    Protocol(#[from] hyper::Error),

    /// The response headers did not arrive in time.
    #[error("no response headers after {0:?}")]
    ResponseHeaderTimeout(Duration),
}

impl Error {
    /// Returns `true` if any timeout caused the failure, including those
    /// enforced inside the dial strategy.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Dial(error) => error.is_timeout(),
            Error::DialTimeout(_) | Error::ResponseHeaderTimeout(_) => true,
            _ => false,
        }
    }
}
