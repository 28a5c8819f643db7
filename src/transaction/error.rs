//! Transaction error types.

use thiserror::Error;

use crate::params::BindError;
use crate::BoxError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Fieldless view of [`TransactionError`] for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyInitialized,
    NotInitialized,
    InUse,
    Acquisition,
    Statement,
    Callback,
    ParameterBinding,
}

/// Errors that can occur while driving a context or a task.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// `init` was called on a context that already holds a transaction.
    #[error("context {context} is already initialised")]
    AlreadyInitialized { context: String },

    /// The operation needs a live transaction and the context has none.
    #[error("cannot {operation}: context {context} is not initialised")]
    NotInitialized {
        context: String,
        operation: &'static str,
    },

    /// The context's connection is lent out, usually to the task that is
    /// making this call from inside its own callback.
    #[error("cannot {operation}: context {context} is in use by a running task")]
    InUse {
        context: String,
        operation: &'static str,
    },

    /// The connection source could not supply a connection.
    #[error("context {context} could not acquire a connection: {source}")]
    Acquisition {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A statement, including BEGIN/COMMIT/ROLLBACK, failed at the backend.
    #[error("statement failed in context {context}: {source} (sql: {sql})")]
    Statement {
        context: String,
        sql: String,
        #[source]
        source: BoxError,
    },

    /// A task callback or a commit/rollback hook returned an error.
    #[error("callback failed in context {context}: {source}")]
    Callback {
        context: String,
        #[source]
        source: BoxError,
    },

    /// A named placeholder could not be bound.
    #[error("parameter binding failed: {0}")]
    ParameterBinding(#[from] BindError),
}

impl TransactionError {
    /// The error's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::AlreadyInitialized { .. } => ErrorKind::AlreadyInitialized,
            TransactionError::NotInitialized { .. } => ErrorKind::NotInitialized,
            TransactionError::InUse { .. } => ErrorKind::InUse,
            TransactionError::Acquisition { .. } => ErrorKind::Acquisition,
            TransactionError::Statement { .. } => ErrorKind::Statement,
            TransactionError::Callback { .. } => ErrorKind::Callback,
            TransactionError::ParameterBinding(_) => ErrorKind::ParameterBinding,
        }
    }

    /// Id of the context the error belongs to, if any.
    pub fn context_id(&self) -> Option<&str> {
        match self {
            TransactionError::AlreadyInitialized { context }
            | TransactionError::NotInitialized { context, .. }
            | TransactionError::InUse { context, .. }
            | TransactionError::Acquisition { context, .. }
            | TransactionError::Statement { context, .. }
            | TransactionError::Callback { context, .. } => Some(context),
            TransactionError::ParameterBinding(_) => None,
        }
    }

    pub(crate) fn not_initialized(context: &str, operation: &'static str) -> Self {
        TransactionError::NotInitialized {
            context: context.to_string(),
            operation,
        }
    }

    pub(crate) fn in_use(context: &str, operation: &'static str) -> Self {
        TransactionError::InUse {
            context: context.to_string(),
            operation,
        }
    }

    pub(crate) fn statement(context: &str, sql: &str, source: BoxError) -> Self {
        TransactionError::Statement {
            context: context.to_string(),
            sql: sql.to_string(),
            source,
        }
    }

    pub(crate) fn callback(context: &str, source: BoxError) -> Self {
        TransactionError::Callback {
            context: context.to_string(),
            source,
        }
    }
}
