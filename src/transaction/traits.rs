//! Object-safe seams between the manager and the context/task kinds.

use std::sync::Arc;

use async_trait::async_trait;

use crate::result::TaskOutput;
use crate::transaction::error::TransactionResult;

/// Something that owns at most one live transaction at a time.
#[async_trait]
pub trait Context: Send + Sync {
    /// Process-unique id, for diagnostics.
    fn id(&self) -> &str;

    /// Human-readable name including the id.
    fn name(&self) -> String;

    /// Open the transaction. Fails if one is already open.
    async fn init(&self) -> TransactionResult<()>;

    /// Commit and tear down. Fails if nothing is open.
    async fn commit(&self) -> TransactionResult<()>;

    /// Roll back and tear down. Fails if nothing is open.
    async fn rollback(&self) -> TransactionResult<()>;

    /// Whether a transaction is open. Never waits on the context's lock.
    fn is_initialized(&self) -> bool;
}

/// One unit of work bound to a context.
#[async_trait]
pub trait Executable: Send + Sync {
    /// The context this task runs in.
    fn context(&self) -> Arc<dyn Context>;

    /// Run the task against its context's live transaction.
    async fn exec(&self) -> TransactionResult<()>;

    /// The stored result, if `exec` has completed successfully.
    fn result(&self) -> Option<TaskOutput>;
}
