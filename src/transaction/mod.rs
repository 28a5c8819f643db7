//! Transaction contexts and the tasks that run in them.
//!
//! A context owns at most one live transaction. Tasks are registered through
//! a context and handed to a [`TransactionManager`], which opens the contexts,
//! runs the tasks in order and settles every context with a commit or a
//! rollback.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   TransactionManager                        │
//! │      (runs tasks in order, commits or rolls back all)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               ┌──────────────┴──────────────┐
//!               │                             │
//!               ▼                             ▼
//!        ┌─────────────┐               ┌─────────────────┐
//!        │  DbContext  │               │ FunctionContext │
//!        │ (one Lease) │               │ (hooks only)    │
//!        └─────────────┘               └─────────────────┘
//!               │
//!               ▼
//!        ┌──────────────────┐
//!        │ ConnectionSource │
//!        └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use mtxn::params::Params;
//! use mtxn::source::PoolConfig;
//! use mtxn::transaction::{DbContext, TransactionManager};
//!
//! # async fn run() -> Result<(), mtxn::BoxError> {
//! let pool = PoolConfig::from_env()?.connect_postgres().await?;
//! let manager = TransactionManager::new();
//! let ctx = Arc::new(DbContext::new(pool));
//!
//! ctx.add_task(&manager, "DELETE FROM users");
//! ctx.add_task_with_params(
//!     &manager,
//!     "INSERT INTO users (id, name) VALUES (:id, :name)",
//!     Params::new().with("id", 1).with("name", "Dave"),
//! );
//!
//! // Commits if every task succeeds, rolls back otherwise.
//! manager.exec().await?;
//! # Ok(())
//! # }
//! ```

mod context;
mod error;
mod function;
mod isolation;
mod manager;
mod task;
mod traits;

pub use context::{ContextOptions, DbContext};
pub use error::{ErrorKind, TransactionError, TransactionResult};
pub use function::{FunctionContext, FunctionFn, FunctionTask, HookFn};
pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use task::{CallbackResult, Task, TaskFn, TaskKind};
pub use traits::{Context, Executable};
