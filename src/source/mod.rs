//! The boundary with the connection pool.
//!
//! A [`ConnectionSource`] hands out [`Lease`]s: a live [`Connection`] paired
//! with a one-shot release callback. Contexts never touch the pool except
//! through `acquire` and the lease's release.
//!
//! `sqlx` pools for SQLite and PostgreSQL implement both traits, so the raw
//! transaction handle seen by callbacks is a `sqlx::pool::PoolConnection`.

mod config;
mod dialect;
mod error;
mod lease;
#[cfg(test)]
pub(crate) mod mock;
mod postgres;
mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::result::ResultSet;
use crate::BoxError;

pub use config::PoolConfig;
pub use dialect::Dialect;
pub use error::{SourceError, SourceResult};
pub use lease::{Lease, Release, ReleaseFn};

/// A live connection that can run positional statements.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Placeholder and transaction-control syntax for this backend.
    fn dialect(&self) -> Dialect;

    /// Run one statement with positional arguments.
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<ResultSet, BoxError>;
}

/// A pool that supplies connections.
#[async_trait]
pub trait ConnectionSource: Send + Sync + 'static {
    type Connection: Connection;

    /// Wait for a connection. May fail if the pool is exhausted or the
    /// backend is unreachable.
    async fn acquire(&self) -> Result<Lease<Self::Connection>, BoxError>;

    /// Dialect of the connections this source hands out. Templates are
    /// tokenized with it before any connection exists.
    fn dialect(&self) -> Dialect;
}

/// Release callback shared by the `sqlx` pool sources.
fn release_pooled<DB: sqlx::Database>(mut conn: sqlx::pool::PoolConnection<DB>, how: Release) {
    if how == Release::Discard {
        conn.close_on_drop();
    }
    drop(conn);
}
