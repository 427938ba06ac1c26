//! Idle connection pooling for the transport.
//!
//! Connections are pooled per [`PoolKey`] and handed out most-recently-used
//! first. Two limits apply across the whole pool: connections idle for longer
//! than the idle timeout are dropped, and when the pool is full the oldest
//! idle connection (whatever its key) makes room for the newest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

mod idle;
mod key;

use self::idle::IdleConnections;
pub(crate) use self::key::PoolKey;

/// A connection that can sit in the pool.
pub(crate) trait PoolableConnection: Send + 'static {
    /// Returns `true` if the connection can take another request.
    fn is_open(&self) -> bool;
}

impl<B> PoolableConnection for hyper::client::conn::http1::SendRequest<B>
where
    B: Send + 'static,
{
    fn is_open(&self) -> bool {
        !self.is_closed() && self.is_ready()
    }
}

/// Pool limits.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    /// How long a connection may sit idle, or `None` to keep it forever.
    pub(crate) idle_timeout: Option<Duration>,

    /// Idle connections kept across all keys.
    pub(crate) max_idle: usize,
}

#[derive(Debug)]
pub(crate) struct Pool<C> {
    inner: Arc<Mutex<PoolInner<C>>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PoolableConnection> Pool<C> {
    pub(crate) fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                config,
                idle: HashMap::new(),
            })),
        }
    }

    /// Take an idle connection for `key`, if there is one.
    pub(crate) fn checkout(&self, key: &PoolKey) -> Option<C> {
        let mut inner = self.inner.lock();
        inner.sweep();

        let idle = inner.idle.get_mut(key)?;
        let conn = idle.pop();
        if idle.is_empty() {
            inner.idle.remove(key);
        }

        if conn.is_some() {
            trace!(%key, "reusing idle connection");
        }
        conn
    }

    /// Return a connection to the pool.
    pub(crate) fn checkin(&self, key: PoolKey, conn: C) {
        if !conn.is_open() {
            trace!(%key, "discarding closed connection");
            return;
        }

        let mut inner = self.inner.lock();
        if inner.config.max_idle == 0 {
            return;
        }

        inner.sweep();
        while inner.len() >= inner.config.max_idle {
            inner.evict_oldest();
        }

        trace!(%key, "connection idle");
        inner.idle.entry(key).or_default().push(conn);

        if let Some(timeout) = inner.config.idle_timeout {
            self.expire_after(timeout);
        }
    }

    /// Sweep the pool once `timeout` has passed, so a connection checked in
    /// now is closed even if no other request arrives.
    fn expire_after(&self, timeout: Duration) {
        let pool = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = pool.upgrade() {
                inner.lock().sweep();
            }
        });
    }

    /// Number of idle connections across all keys.
    pub(crate) fn idle_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.sweep();
        inner.len()
    }
}

#[derive(Debug)]
struct PoolInner<C> {
    config: Config,
    idle: HashMap<PoolKey, IdleConnections<C>>,
}

impl<C: PoolableConnection> PoolInner<C> {
    fn len(&self) -> usize {
        self.idle.values().map(IdleConnections::len).sum()
    }

    fn sweep(&mut self) {
        let cutoff = self
            .config
            .idle_timeout
            .and_then(|timeout| Instant::now().checked_sub(timeout));

        self.idle.retain(|_, idle| {
            idle.expire(cutoff);
            !idle.is_empty()
        });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .idle
            .iter()
            .filter_map(|(key, idle)| idle.oldest().map(|at| (at, key)))
            .min_by_key(|(at, _)| *at)
            .map(|(_, key)| key.clone());

        let Some(key) = oldest else {
            return;
        };

        trace!(%key, "evicting oldest idle connection");
        if let Some(idle) = self.idle.get_mut(&key) {
            idle.evict_oldest();
            if idle.is_empty() {
                self.idle.remove(&key);
            }
        }
    }
}
