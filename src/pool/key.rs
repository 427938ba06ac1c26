use std::fmt;

use http::uri::{Authority, Scheme};

/// Identifies which idle connections can serve a request: scheme, authority
/// and, for requests sent through a forward proxy, the proxy's authority.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) struct PoolKey {
    scheme: Scheme,
    authority: Authority,
    proxy: Option<Authority>,
}

impl PoolKey {
    pub(crate) fn new(scheme: Scheme, authority: Authority, proxy: Option<Authority>) -> Self {
        Self {
            scheme,
            authority,
            proxy,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}
