//! SQL transaction context.
//!
//! A [`DbContext`] owns at most one pooled connection with an open
//! transaction. Its lifecycle is:
//!
//! ```text
//!   uninitialized ──init──▶ active ──commit / rollback──▶ uninitialized
//! ```
//!
//! `init` acquires a connection and issues an explicit `BEGIN`. `commit` and
//! `rollback` always hand the connection back to its source exactly once,
//! whether or not the COMMIT/ROLLBACK statement succeeded, and the release
//! happens before the call returns.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};
use tracing::Span;
use ulid::Ulid;

use crate::params::ParamSource;
use crate::source::{Connection, ConnectionSource, Dialect, Lease, Release};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::manager::TransactionManager;
use crate::transaction::task::{CallbackResult, Task};
use crate::transaction::traits::Context;

/// Options applied when a context opens its transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Isolation level for BEGIN; `None` keeps the backend default.
    pub isolation: Option<IsolationLevel>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }
}

/// Transaction-control statements issued by the context itself.
#[derive(Debug, Clone, Copy)]
enum Control {
    Begin,
    Commit,
    Rollback,
}

impl Control {
    fn sql(self, dialect: Dialect, isolation: Option<IsolationLevel>) -> String {
        match self {
            Control::Begin => dialect.begin_statement(isolation),
            Control::Commit => dialect.commit_statement().to_string(),
            Control::Rollback => dialect.rollback_statement().to_string(),
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Control::Begin => "begin",
            Control::Commit => "commit",
            Control::Rollback => "roll back",
        }
    }
}

/// Generate a process-unique context id.
pub(crate) fn new_context_id() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// A context backed by one pooled SQL connection.
///
/// The live connection sits behind an async lock that a running task holds
/// for its whole duration. Calls that need the connection never wait on that
/// lock: made from inside a task's callback they fail with
/// [`TransactionError::InUse`]. The start time is kept outside the lock so
/// `is_initialized` and `active_since` always answer.
pub struct DbContext<S: ConnectionSource> {
    id: String,
    source: S,
    options: ContextOptions,
    lease: Mutex<Option<Lease<S::Connection>>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    span: Span,
}

impl<S: ConnectionSource> DbContext<S> {
    /// Create an uninitialised context over a connection source.
    pub fn new(source: S) -> Self {
        Self::with_options(source, ContextOptions::default())
    }

    /// Create an uninitialised context with explicit options.
    pub fn with_options(source: S, options: ContextOptions) -> Self {
        let id = new_context_id();
        Self {
            span: tracing::info_span!("mtxn.context", kind = "sql", context_id = %id),
            id,
            source,
            options,
            lease: Mutex::new(None),
            started_at: RwLock::new(None),
        }
    }

    /// Record lifecycle events under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        format!("SQL context: {}", self.id)
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    /// Acquire a connection and open a transaction on it.
    ///
    /// If BEGIN fails, the connection is discarded and the context stays
    /// uninitialised.
    pub async fn init(&self) -> TransactionResult<&Self> {
        let mut slot = self.lock_lease("initialise")?;
        if slot.is_some() {
            return Err(TransactionError::AlreadyInitialized {
                context: self.id.clone(),
            });
        }

        let mut lease = self.source.acquire().await.map_err(|source| {
            tracing::warn!(parent: &self.span, error = %source, "connection acquisition failed");
            TransactionError::Acquisition {
                context: self.id.clone(),
                source,
            }
        })?;

        if let Err(err) = self.run_control(&mut lease, Control::Begin).await {
            lease.release(Release::Discard);
            tracing::warn!(parent: &self.span, error = %err, "begin failed, connection discarded");
            return Err(err);
        }

        *slot = Some(lease);
        *self.started_at.write() = Some(Utc::now());
        tracing::debug!(parent: &self.span, "transaction started");
        Ok(self)
    }

    /// Commit the open transaction and release the connection.
    pub async fn commit(&self) -> TransactionResult<&Self> {
        self.finish(Control::Commit).await
    }

    /// Roll back the open transaction and release the connection.
    pub async fn rollback(&self) -> TransactionResult<&Self> {
        self.finish(Control::Rollback).await
    }

    pub fn is_initialized(&self) -> bool {
        self.started_at.read().is_some()
    }

    /// When the open transaction started, if there is one.
    pub fn active_since(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read()
    }

    /// Borrow the live connection.
    ///
    /// The guard keeps the connection lent out: drop it before calling
    /// `init`, `commit`, `rollback` or `get_transaction` on the same context.
    /// Those calls fail with `InUse` while it is held.
    pub fn get_transaction(&self) -> TransactionResult<MappedMutexGuard<'_, S::Connection>> {
        let slot = self.lock_lease("access the transaction")?;
        MutexGuard::try_map(slot, |slot| slot.as_mut().and_then(Lease::connection))
            .map_err(|_| TransactionError::not_initialized(&self.id, "access the transaction"))
    }

    /// Register a statement without parameters.
    pub fn add_task(
        self: &Arc<Self>,
        manager: &TransactionManager,
        sql: impl Into<String>,
    ) -> Arc<Task<S>> {
        self.register(manager, Task::sql(self.clone(), sql, None))
    }

    /// Register a statement with named parameters.
    pub fn add_task_with_params(
        self: &Arc<Self>,
        manager: &TransactionManager,
        sql: impl Into<String>,
        params: impl Into<ParamSource>,
    ) -> Arc<Task<S>> {
        self.register(manager, Task::sql(self.clone(), sql, Some(params.into())))
    }

    /// Register a callback that runs against the raw connection.
    pub fn add_function_task<F>(self: &Arc<Self>, manager: &TransactionManager, callback: F) -> Arc<Task<S>>
    where
        F: for<'a> Fn(&'a mut S::Connection, &'a Task<S>) -> BoxFuture<'a, CallbackResult>
            + Send
            + Sync
            + 'static,
    {
        self.register(manager, Task::callback(self.clone(), callback))
    }

    fn register(&self, manager: &TransactionManager, task: Task<S>) -> Arc<Task<S>> {
        let task = Arc::new(task);
        manager.add_task(task.clone());
        task
    }

    fn lock_lease(
        &self,
        operation: &'static str,
    ) -> TransactionResult<MutexGuard<'_, Option<Lease<S::Connection>>>> {
        self.lease
            .try_lock()
            .map_err(|_| TransactionError::in_use(&self.id, operation))
    }

    // The lease is detached and released while the lock is held, so no other
    // caller can observe a half torn-down context.
    async fn finish(&self, control: Control) -> TransactionResult<&Self> {
        let mut slot = self.lock_lease(control.operation())?;
        let Some(mut lease) = slot.take() else {
            return Err(TransactionError::not_initialized(&self.id, control.operation()));
        };

        let outcome = self.run_control(&mut lease, control).await;
        lease.release(if outcome.is_ok() {
            Release::Reuse
        } else {
            Release::Discard
        });
        let started_at = self.started_at.write().take();
        drop(slot);

        let elapsed_ms = started_at.map_or(0, |at| (Utc::now() - at).num_milliseconds());
        match &outcome {
            Ok(()) => {
                tracing::debug!(parent: &self.span, elapsed_ms, "{} done", control.operation())
            }
            Err(err) => {
                tracing::warn!(parent: &self.span, elapsed_ms, error = %err, "{} failed, connection discarded", control.operation())
            }
        }
        outcome.map(|()| self)
    }

    async fn run_control(
        &self,
        lease: &mut Lease<S::Connection>,
        control: Control,
    ) -> TransactionResult<()> {
        let conn = lease
            .connection()
            .ok_or_else(|| TransactionError::not_initialized(&self.id, control.operation()))?;
        let sql = control.sql(conn.dialect(), self.options.isolation);
        conn.query(&sql, &[])
            .await
            .map(|_| ())
            .map_err(|source| TransactionError::statement(&self.id, &sql, source))
    }
}

#[async_trait]
impl<S: ConnectionSource> Context for DbContext<S> {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> String {
        DbContext::name(self)
    }

    async fn init(&self) -> TransactionResult<()> {
        DbContext::init(self).await.map(|_| ())
    }

    async fn commit(&self) -> TransactionResult<()> {
        DbContext::commit(self).await.map(|_| ())
    }

    async fn rollback(&self) -> TransactionResult<()> {
        DbContext::rollback(self).await.map(|_| ())
    }

    fn is_initialized(&self) -> bool {
        DbContext::is_initialized(self)
    }
}

impl<S: ConnectionSource> fmt::Debug for DbContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbContext")
            .field("id", &self.id)
            .field("options", &self.options)
            .finish()
    }
}
