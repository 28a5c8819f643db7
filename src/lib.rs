//! mtxn - transactional units of work over pooled SQL connections.
//!
//! A [`DbContext`] holds one pooled connection with an open transaction.
//! Tasks are either SQL templates with `:name` placeholders or callbacks on
//! the raw connection. A [`TransactionManager`] runs the tasks of one or more
//! contexts in order and commits them all, or rolls them all back when any
//! task fails.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mtxn::{DbContext, Params, PoolConfig, TaskOutput, TransactionManager};
//!
//! # async fn run() -> Result<(), mtxn::BoxError> {
//! let pool = PoolConfig::new("sqlite://app.db").connect_sqlite().await?;
//! let manager = TransactionManager::new();
//! let ctx = Arc::new(DbContext::new(pool));
//!
//! ctx.add_function_task(&manager, |conn, _task| {
//!     Box::pin(async move {
//!         sqlx::query("INSERT INTO users (name) VALUES ('Stuart')")
//!             .execute(&mut **conn)
//!             .await?;
//!         Ok::<_, mtxn::BoxError>(TaskOutput::Unit)
//!     })
//! });
//! let users = ctx.add_task_with_params(
//!     &manager,
//!     "SELECT * FROM users WHERE name = :name",
//!     Params::new().with("name", "Stuart"),
//! );
//!
//! manager.exec().await?;
//! assert_eq!(users.rows().map(|rows| rows.len()), Some(1));
//! # Ok(())
//! # }
//! ```

pub mod params;
pub mod result;
pub mod source;
pub mod transaction;

/// Boxed error used at the driver and callback boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use params::{ParamSource, Params};
pub use result::{ResultSet, TaskOutput};
pub use source::{Connection, ConnectionSource, Dialect, Lease, PoolConfig, Release};
pub use transaction::{
    Context, ContextOptions, DbContext, ErrorKind, Executable, FunctionContext, FunctionTask,
    IsolationLevel, Task, TransactionError, TransactionManager, TransactionResult,
};
