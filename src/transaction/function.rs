//! Connection-less contexts.
//!
//! A [`FunctionContext`] takes part in a unit of work without owning a
//! database connection. Its tasks run plain async callbacks and may carry
//! hooks that fire when the context commits or rolls back, which is how
//! side effects outside the database are kept in step with it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::Span;

use crate::params::{ParamSource, Params};
use crate::result::TaskOutput;
use crate::transaction::context::new_context_id;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::manager::TransactionManager;
use crate::transaction::task::CallbackResult;
use crate::transaction::traits::{Context, Executable};
use crate::BoxError;

/// Body of a function task.
pub type FunctionFn =
    Box<dyn for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, CallbackResult> + Send + Sync>;

/// Commit or rollback hook of a function task.
pub type HookFn =
    Box<dyn for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, Result<(), BoxError>> + Send + Sync>;

/// A context with no connection behind it.
pub struct FunctionContext {
    id: String,
    active: AtomicBool,
    tasks: Mutex<Vec<Weak<FunctionTask>>>,
    span: Span,
}

impl FunctionContext {
    pub fn new() -> Self {
        let id = new_context_id();
        Self {
            span: tracing::info_span!("mtxn.context", kind = "function", context_id = %id),
            id,
            active: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> String {
        format!("Function context: {}", self.id)
    }

    pub fn is_initialized(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Register a task without hooks.
    pub fn add_task<F>(self: &Arc<Self>, manager: &TransactionManager, exec: F) -> Arc<FunctionTask>
    where
        F: for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, CallbackResult> + Send + Sync + 'static,
    {
        self.register(manager, Box::new(exec), None, None)
    }

    /// Register a task with hooks run on commit and on rollback.
    pub fn add_task_with_hooks<F, C, R>(
        self: &Arc<Self>,
        manager: &TransactionManager,
        exec: F,
        on_commit: C,
        on_rollback: R,
    ) -> Arc<FunctionTask>
    where
        F: for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, CallbackResult> + Send + Sync + 'static,
        C: for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
        R: for<'a> Fn(&'a FunctionTask) -> BoxFuture<'a, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.register(
            manager,
            Box::new(exec),
            Some(Box::new(on_commit)),
            Some(Box::new(on_rollback)),
        )
    }

    fn register(
        self: &Arc<Self>,
        manager: &TransactionManager,
        exec: FunctionFn,
        on_commit: Option<HookFn>,
        on_rollback: Option<HookFn>,
    ) -> Arc<FunctionTask> {
        let task = Arc::new(FunctionTask {
            context: self.clone(),
            exec,
            on_commit,
            on_rollback,
            executed: AtomicBool::new(false),
            params: Mutex::new(None),
            result: Mutex::new(None),
        });
        self.tasks.lock().push(Arc::downgrade(&task));
        manager.add_task(task.clone());
        task
    }

    pub async fn init(&self) -> TransactionResult<&Self> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TransactionError::AlreadyInitialized {
                context: self.id.clone(),
            })?;
        tracing::debug!(parent: &self.span, "transaction started");
        Ok(self)
    }

    /// Run commit hooks of executed tasks in registration order.
    ///
    /// Every hook runs even if an earlier one failed; the first failure is
    /// returned. The context is inactive afterwards either way.
    pub async fn commit(&self) -> TransactionResult<&Self> {
        let executed = self.take_executed("commit")?;
        let mut first_error = None;
        for task in &executed {
            let Some(hook) = &task.on_commit else {
                continue;
            };
            if let Err(source) = hook(task.as_ref()).await {
                tracing::warn!(parent: &self.span, error = %source, "commit hook failed");
                first_error.get_or_insert(TransactionError::callback(&self.id, source));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::debug!(parent: &self.span, tasks = executed.len(), "commit done");
                Ok(self)
            }
        }
    }

    /// Run rollback hooks of executed tasks in reverse order.
    ///
    /// Every hook runs even if an earlier one failed; the first failure is
    /// returned.
    pub async fn rollback(&self) -> TransactionResult<&Self> {
        let executed = self.take_executed("roll back")?;
        let mut first_error = None;
        for task in executed.iter().rev() {
            let Some(hook) = &task.on_rollback else {
                continue;
            };
            if let Err(source) = hook(task.as_ref()).await {
                tracing::warn!(parent: &self.span, error = %source, "rollback hook failed");
                first_error.get_or_insert(TransactionError::callback(&self.id, source));
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::debug!(parent: &self.span, tasks = executed.len(), "roll back done");
                Ok(self)
            }
        }
    }

    // Deactivates the context and hands back the tasks that ran in it, with
    // their executed flags cleared for the next transaction.
    fn take_executed(&self, operation: &'static str) -> TransactionResult<Vec<Arc<FunctionTask>>> {
        self.active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TransactionError::not_initialized(&self.id, operation))?;

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| task.strong_count() > 0);
        Ok(tasks
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|task| task.executed.swap(false, Ordering::SeqCst))
            .collect())
    }
}

impl Default for FunctionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Context for FunctionContext {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> String {
        FunctionContext::name(self)
    }

    async fn init(&self) -> TransactionResult<()> {
        FunctionContext::init(self).await.map(|_| ())
    }

    async fn commit(&self) -> TransactionResult<()> {
        FunctionContext::commit(self).await.map(|_| ())
    }

    async fn rollback(&self) -> TransactionResult<()> {
        FunctionContext::rollback(self).await.map(|_| ())
    }

    fn is_initialized(&self) -> bool {
        FunctionContext::is_initialized(self)
    }
}

impl fmt::Debug for FunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionContext")
            .field("id", &self.id)
            .field("active", &self.is_initialized())
            .finish()
    }
}

/// A task in a [`FunctionContext`].
pub struct FunctionTask {
    context: Arc<FunctionContext>,
    exec: FunctionFn,
    on_commit: Option<HookFn>,
    on_rollback: Option<HookFn>,
    executed: AtomicBool,
    params: Mutex<Option<ParamSource>>,
    result: Mutex<Option<TaskOutput>>,
}

impl FunctionTask {
    pub fn context(&self) -> &Arc<FunctionContext> {
        &self.context
    }

    pub fn set_params(&self, params: impl Into<ParamSource>) {
        *self.params.lock() = Some(params.into());
    }

    pub fn params(&self) -> Option<ParamSource> {
        self.params.lock().clone()
    }

    /// Evaluate the parameter source now.
    pub fn resolve_params(&self) -> Option<Params> {
        let source = self.params.lock().clone();
        source.map(|source| source.resolve())
    }

    pub fn result(&self) -> Option<TaskOutput> {
        self.result.lock().clone()
    }

    /// Whether the task has run in the current transaction.
    pub fn is_executed(&self) -> bool {
        self.executed.load(Ordering::SeqCst)
    }

    /// Run the task body. The context must be active.
    pub async fn exec(&self) -> TransactionResult<&Self> {
        if !self.context.is_initialized() {
            return Err(TransactionError::not_initialized(&self.context.id, "run a task"));
        }
        let output = (self.exec)(self)
            .await
            .map_err(|source| TransactionError::callback(&self.context.id, source))?;

        *self.result.lock() = Some(output);
        self.executed.store(true, Ordering::SeqCst);
        Ok(self)
    }
}

#[async_trait]
impl Executable for FunctionTask {
    fn context(&self) -> Arc<dyn Context> {
        self.context.clone()
    }

    async fn exec(&self) -> TransactionResult<()> {
        FunctionTask::exec(self).await.map(|_| ())
    }

    fn result(&self) -> Option<TaskOutput> {
        FunctionTask::result(self)
    }
}

impl fmt::Debug for FunctionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTask")
            .field("context", &self.context.id)
            .field("executed", &self.is_executed())
            .field("hooks", &(self.on_commit.is_some(), self.on_rollback.is_some()))
            .finish()
    }
}
