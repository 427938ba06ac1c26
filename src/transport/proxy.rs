//! Forward proxy selection from the environment.

use std::net::IpAddr;

use http::uri::{Scheme, Uri};

/// Which forward proxy, if any, a request should go through.
///
/// Built from the conventional `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`
/// variables (upper case taking precedence over lower case). The rule is read
/// once and never changes afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRule {
    http: Option<Uri>,
    https: Option<Uri>,
    no_proxy: NoProxy,
}

impl ProxyRule {
    /// A rule that never proxies.
    pub fn none() -> Self {
        Self::default()
    }

    /// Read the rule from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|value| !value.trim().is_empty())
        };

        let mut rule = Self::none();
        if let Some(value) = var("HTTP_PROXY", "http_proxy") {
            rule.http = parse_proxy(&value);
        }
        if let Some(value) = var("HTTPS_PROXY", "https_proxy") {
            rule.https = parse_proxy(&value);
        }
        if let Some(value) = var("NO_PROXY", "no_proxy") {
            rule.no_proxy = NoProxy::parse(&value);
        }

        tracing::trace!(?rule, "proxy rule from environment");
        rule
    }

    /// Send `http` requests through `proxy`.
    ///
    /// Values that are not a usable proxy URI are ignored with a warning.
    pub fn with_http_proxy(mut self, proxy: &str) -> Self {
        self.http = parse_proxy(proxy);
        self
    }

    /// Tunnel `https` connections through `proxy`.
    pub fn with_https_proxy(mut self, proxy: &str) -> Self {
        self.https = parse_proxy(proxy);
        self
    }

    /// Bypass the proxy for hosts in a comma separated `NO_PROXY` list.
    pub fn with_no_proxy(mut self, list: &str) -> Self {
        self.no_proxy = NoProxy::parse(list);
        self
    }

    /// The proxy to use for a request to `host` with `scheme`.
    pub fn proxy_for(&self, scheme: &Scheme, host: &str) -> Option<&Uri> {
        let proxy = if *scheme == Scheme::HTTPS {
            self.https.as_ref()
        } else if *scheme == Scheme::HTTP {
            self.http.as_ref()
        } else {
            None
        }?;

        if self.no_proxy.matches(host) {
            tracing::trace!(%host, "proxy bypassed by no_proxy");
            return None;
        }
        Some(proxy)
    }
}

/// Parse a proxy setting, accepting a bare `host:port`.
fn parse_proxy(value: &str) -> Option<Uri> {
    let value = value.trim();
    let parsed = if value.contains("://") {
        value.parse::<Uri>()
    } else {
        format!("http://{value}").parse::<Uri>()
    };

    match parsed {
        Ok(uri) if uri.scheme() == Some(&Scheme::HTTP) && uri.authority().is_some() => Some(uri),
        Ok(uri) => {
            tracing::warn!(proxy = %uri, "ignoring proxy: only http:// proxies are supported");
            None
        }
        Err(error) => {
            tracing::warn!(%error, "ignoring invalid proxy setting");
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct NoProxy {
    all: bool,
    hosts: Vec<String>,
}

impl NoProxy {
    fn parse(list: &str) -> Self {
        let mut no_proxy = NoProxy::default();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry == "*" {
                no_proxy.all = true;
                continue;
            }
            let host = strip_port(entry).trim_start_matches('.');
            no_proxy.hosts.push(host.to_ascii_lowercase());
        }
        no_proxy
    }

    fn matches(&self, host: &str) -> bool {
        if self.all {
            return true;
        }

        let host = host.trim_start_matches('[').trim_end_matches(']');
        let host = host.to_ascii_lowercase();
        self.hosts.iter().any(|entry| {
            if entry.parse::<IpAddr>().is_ok() {
                return *entry == host;
            }
            host == *entry
                || host
                    .strip_suffix(entry.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

fn strip_port(entry: &str) -> &str {
    if let Some(rest) = entry.strip_prefix('[') {
        return rest.split_once(']').map_or(rest, |(host, _)| host);
    }
    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => host,
        _ => entry,
    }
}
