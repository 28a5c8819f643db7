//! Pooled connection leases.

use std::fmt;

/// How a connection goes back to its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The connection is clean and can be reused.
    Reuse,
    /// The connection's state is unknown; the pool should close it.
    Discard,
}

/// Callback that returns a connection to its pool.
pub type ReleaseFn<C> = Box<dyn FnOnce(C, Release) + Send>;

/// A connection checked out of a pool, together with its release callback.
///
/// `release` consumes the lease, so a connection can be handed back at most
/// once. A lease dropped without being released (for example when the future
/// holding it is cancelled) discards its connection.
pub struct Lease<C> {
    conn: Option<C>,
    release: Option<ReleaseFn<C>>,
}

impl<C> Lease<C> {
    /// Pair a connection with its release callback.
    pub fn new<F>(conn: C, release: F) -> Self
    where
        F: FnOnce(C, Release) + Send + 'static,
    {
        Self {
            conn: Some(conn),
            release: Some(Box::new(release)),
        }
    }

    /// Borrow the live connection. `None` only after release.
    pub fn connection(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    /// Hand the connection back to the pool.
    pub fn release(mut self, how: Release) {
        self.release_inner(how);
    }

    fn release_inner(&mut self, how: Release) {
        if let (Some(conn), Some(release)) = (self.conn.take(), self.release.take()) {
            release(conn, how);
        }
    }
}

impl<C> Drop for Lease<C> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::warn!("connection lease dropped without release, discarding connection");
            self.release_inner(Release::Discard);
        }
    }
}

impl<C> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("live", &self.conn.is_some())
            .finish()
    }
}
