use tokio::time::Instant;
use tracing::trace;

use super::PoolableConnection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Idle connections for one key, oldest first.
#[derive(Debug)]
pub(super) struct IdleConnections<T> {
    inner: Vec<Idle<T>>,
}

impl<T> Default for IdleConnections<T> {
    fn default() -> Self {
        Self { inner: Vec::new() }
    }
}

impl<T: PoolableConnection> IdleConnections<T> {
    pub(super) fn push(&mut self, inner: T) {
        self.inner.push(Idle::new(inner));
    }

    /// Take the most recently returned connection that is still open.
    pub(super) fn pop(&mut self) -> Option<T> {
        while let Some(entry) = self.inner.pop() {
            if entry.inner.is_open() {
                trace!("found idle connection");
                return Some(entry.inner);
            }
            trace!("found closed connection");
        }
        None
    }

    /// Drop connections that went idle at or before `cutoff` and any that
    /// have closed.
    pub(super) fn expire(&mut self, cutoff: Option<Instant>) {
        let before = self.inner.len();
        self.inner.retain(|entry| {
            cutoff.map_or(true, |cutoff| entry.at > cutoff) && entry.inner.is_open()
        });
        let dropped = before - self.inner.len();
        if dropped > 0 {
            trace!(dropped, "expired idle connections");
        }
    }

    /// When the oldest connection went idle.
    pub(super) fn oldest(&self) -> Option<Instant> {
        self.inner.first().map(|entry| entry.at)
    }

    pub(super) fn evict_oldest(&mut self) {
        if !self.inner.is_empty() {
            self.inner.remove(0);
        }
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
