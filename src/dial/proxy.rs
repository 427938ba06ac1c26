//! Alternate routing when the API cannot be reached directly.
//!
//! [`ProxyTlsDialer`] wraps another strategy. Dials to the direct address go
//! to the current route, which is the direct address itself until a dial
//! fails. After a failure, and only while proxying is allowed, a
//! [`ProxyProvider`] is asked for a reachable alternate server and the route
//! switches to it for a limited time. All other addresses pass straight
//! through to the wrapped strategy.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::Instrument as _;

use super::{DialError, Network, TlsConnection, TlsDialer};
use crate::config::{PROXY_USE_DURATION, ROOT_ADDRESS};
use crate::{BoxError, BoxFuture};

/// Finds an alternate server that can reach the API.
pub trait ProxyProvider: fmt::Debug + Send + Sync + 'static {
    /// Return the `host:port` of a reachable alternate server.
    fn find_reachable_server(&self) -> BoxFuture<'static, Result<String, BoxError>>;
}

/// Turns alternate routing on and off.
pub trait ProxyController {
    /// Allow switching to an alternate route after a failed direct dial.
    fn allow_proxy(&self);

    /// Forbid alternate routes and go back to dialing directly.
    fn disallow_proxy(&self);
}

#[derive(Debug, Clone)]
enum Route {
    Direct,
    Proxy { address: Arc<str>, until: Instant },
}

#[derive(Debug)]
struct State {
    route: Route,
    allowed: bool,

    /// Bumped on every route change so that callers waiting on the switch
    /// lock can tell whether someone else already switched.
    generation: u64,
}

impl State {
    fn revert(&mut self) {
        if matches!(self.route, Route::Proxy { .. }) {
            self.route = Route::Direct;
            self.generation += 1;
        }
    }
}

/// Dials through an alternate route when the direct one fails.
///
/// Clones share routing state.
pub struct ProxyTlsDialer<D> {
    dialer: Arc<D>,
    provider: Arc<dyn ProxyProvider>,
    direct: Arc<str>,
    use_duration: Duration,
    state: Arc<Mutex<State>>,
    switching: Arc<tokio::sync::Mutex<()>>,
}

impl<D> Clone for ProxyTlsDialer<D> {
    fn clone(&self) -> Self {
        Self {
            dialer: self.dialer.clone(),
            provider: self.provider.clone(),
            direct: self.direct.clone(),
            use_duration: self.use_duration,
            state: self.state.clone(),
            switching: self.switching.clone(),
        }
    }
}

impl<D: fmt::Debug> fmt::Debug for ProxyTlsDialer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProxyTlsDialer")
            .field("dialer", &self.dialer)
            .field("direct", &self.direct)
            .field("route", &state.route)
            .field("allowed", &state.allowed)
            .finish()
    }
}

impl<D> ProxyTlsDialer<D> {
    /// Wrap `dialer`, finding alternate routes with `provider`.
    ///
    /// The direct address defaults to [`ROOT_ADDRESS`] and alternate routes
    /// are used for [`PROXY_USE_DURATION`]. Proxying starts out disallowed.
    pub fn new(dialer: D, provider: Arc<dyn ProxyProvider>) -> Self {
        Self {
            dialer: Arc::new(dialer),
            provider,
            direct: ROOT_ADDRESS.into(),
            use_duration: PROXY_USE_DURATION,
            state: Arc::new(Mutex::new(State {
                route: Route::Direct,
                allowed: false,
                generation: 0,
            })),
            switching: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Route dials to `address` instead of [`ROOT_ADDRESS`].
    pub fn with_direct_address(mut self, address: impl Into<Arc<str>>) -> Self {
        self.direct = address.into();
        self
    }

    /// Keep an alternate route for `duration` before going back to direct.
    pub fn with_use_duration(mut self, duration: Duration) -> Self {
        self.use_duration = duration;
        self
    }

    /// The address dials to the direct address are currently sent to.
    pub fn current_route(&self) -> String {
        let mut state = self.state.lock();
        route_address(&mut state, &self.direct).to_string()
    }

    /// Whether dials are currently going through an alternate route.
    pub fn is_proxied(&self) -> bool {
        self.current_route() != *self.direct
    }

    /// Whether switching to an alternate route is allowed.
    pub fn is_proxy_allowed(&self) -> bool {
        self.state.lock().allowed
    }
}

impl<D> ProxyController for ProxyTlsDialer<D> {
    fn allow_proxy(&self) {
        tracing::debug!("alternate routing allowed");
        self.state.lock().allowed = true;
    }

    fn disallow_proxy(&self) {
        tracing::debug!("alternate routing disallowed");
        let mut state = self.state.lock();
        state.allowed = false;
        state.revert();
    }
}

/// The current route, reverting an expired alternate route first.
fn route_address(state: &mut State, direct: &Arc<str>) -> Arc<str> {
    if let Route::Proxy { until, .. } = state.route {
        if Instant::now() >= until {
            tracing::debug!("alternate route expired, dialing directly");
            state.revert();
        }
    }

    match &state.route {
        Route::Direct => direct.clone(),
        Route::Proxy { address, .. } => address.clone(),
    }
}

impl<D: TlsDialer> TlsDialer for ProxyTlsDialer<D> {
    fn dial_tls(
        &self,
        network: Network,
        address: &str,
    ) -> BoxFuture<'static, Result<TlsConnection, DialError>> {
        if address != &*self.direct {
            return self.dialer.dial_tls(network, address);
        }

        let this = self.clone();
        let span = tracing::debug_span!("proxy", %address);
        Box::pin(async move { this.dial_routed(network).await }.instrument(span))
    }
}

impl<D: TlsDialer> ProxyTlsDialer<D> {
    async fn dial_routed(self, network: Network) -> Result<TlsConnection, DialError> {
        let (route, generation) = {
            let mut state = self.state.lock();
            (route_address(&mut state, &self.direct), state.generation)
        };

        let error = match self.dialer.dial_tls(network, &route).await {
            Ok(conn) => return Ok(conn),
            Err(error) => error,
        };

        if !self.is_proxy_allowed() {
            return Err(error);
        }
        tracing::debug!(%route, %error, "dial failed, looking for an alternate route");

        let _switching = self.switching.lock().await;

        let switched = {
            let mut state = self.state.lock();
            let current = route_address(&mut state, &self.direct);
            (state.generation != generation).then_some(current)
        };
        if let Some(route) = switched {
            tracing::trace!(%route, "route changed while waiting, retrying");
            return self.dialer.dial_tls(network, &route).await;
        }

        let proxy: Arc<str> = self
            .provider
            .find_reachable_server()
            .await
            .map_err(|source| DialError::Routing {
                address: self.direct.to_string(),
                source,
            })?
            .into();

        {
            let mut state = self.state.lock();
            if !state.allowed {
                return Err(error);
            }
            state.route = Route::Proxy {
                address: proxy.clone(),
                until: Instant::now() + self.use_duration,
            };
            state.generation += 1;
        }
        tracing::info!(route = %proxy, duration = ?self.use_duration, "switched to alternate route");

        self.dialer.dial_tls(network, &proxy).await
    }
}
