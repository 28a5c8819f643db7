//! Tasks bound to a SQL context.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::params::{NamedQuery, ParamSource, Params};
use crate::result::{ResultSet, TaskOutput};
use crate::source::{Connection, ConnectionSource};
use crate::transaction::context::DbContext;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::traits::{Context, Executable};
use crate::BoxError;

/// What a task callback resolves to.
pub type CallbackResult = Result<TaskOutput, BoxError>;

/// Callback run against the raw connection of a live transaction.
pub type TaskFn<S> = Box<
    dyn for<'a> Fn(&'a mut <S as ConnectionSource>::Connection, &'a Task<S>) -> BoxFuture<'a, CallbackResult>
        + Send
        + Sync,
>;

/// The two kinds of work a task can carry. Exactly one is set per task.
pub enum TaskKind<S: ConnectionSource> {
    /// A statement with `:name` placeholders.
    Sql(NamedQuery),
    /// An arbitrary operation on the live connection.
    Callback(TaskFn<S>),
}

/// A single operation bound to one [`DbContext`].
///
/// Nothing runs until [`exec`](Task::exec); the result of the last successful
/// run stays in the task for the caller to inspect.
pub struct Task<S: ConnectionSource> {
    context: Arc<DbContext<S>>,
    kind: TaskKind<S>,
    params: Mutex<Option<ParamSource>>,
    result: Mutex<Option<TaskOutput>>,
}

impl<S: ConnectionSource> Task<S> {
    /// Create a statement task.
    pub fn sql(
        context: Arc<DbContext<S>>,
        template: impl Into<String>,
        params: Option<ParamSource>,
    ) -> Self {
        Self {
            kind: TaskKind::Sql(NamedQuery::parse(template, context.source().dialect())),
            context,
            params: Mutex::new(params),
            result: Mutex::new(None),
        }
    }

    /// Create a callback task.
    pub fn callback<F>(context: Arc<DbContext<S>>, callback: F) -> Self
    where
        F: for<'a> Fn(&'a mut S::Connection, &'a Task<S>) -> BoxFuture<'a, CallbackResult>
            + Send
            + Sync
            + 'static,
    {
        Self {
            context,
            kind: TaskKind::Callback(Box::new(callback)),
            params: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<DbContext<S>> {
        &self.context
    }

    pub fn kind(&self) -> &TaskKind<S> {
        &self.kind
    }

    /// The SQL template, for statement tasks.
    pub fn template(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Sql(query) => Some(query.template()),
            TaskKind::Callback(_) => None,
        }
    }

    /// Replace the parameter source. Takes effect on the next `exec`.
    pub fn set_params(&self, params: impl Into<ParamSource>) {
        *self.params.lock() = Some(params.into());
    }

    /// The current parameter source.
    pub fn params(&self) -> Option<ParamSource> {
        self.params.lock().clone()
    }

    /// Evaluate the parameter source now.
    pub fn resolve_params(&self) -> Option<Params> {
        // Clone out first so a producer can read this task without deadlocking.
        let source = self.params.lock().clone();
        source.map(|source| source.resolve())
    }

    /// The stored result, or `None` until `exec` has succeeded.
    pub fn result(&self) -> Option<TaskOutput> {
        self.result.lock().clone()
    }

    /// The stored rows of a statement task.
    pub fn rows(&self) -> Option<ResultSet> {
        self.result().and_then(TaskOutput::into_rows)
    }

    /// Run the task against the context's live transaction.
    ///
    /// Statement tasks resolve their parameters here, so deferred producers
    /// observe everything that ran before them. On failure the previous
    /// result is left untouched.
    ///
    /// The connection stays lent to this task until it finishes. A callback
    /// may still read `is_initialized` and `active_since` on its context, but
    /// `get_transaction`, `commit` and friends fail with `InUse`.
    pub async fn exec(&self) -> TransactionResult<&Self> {
        let mut conn = self.context.get_transaction()?;

        let output = match &self.kind {
            TaskKind::Callback(callback) => callback(&mut *conn, self)
                .await
                .map_err(|source| TransactionError::callback(self.context.id(), source))?,
            TaskKind::Sql(query) => {
                let params = self.resolve_params();
                let bound = query.bind(params.as_ref())?;
                tracing::debug!(
                    parent: self.context.span(),
                    sql = %bound.sql,
                    args = bound.args.len(),
                    "executing statement"
                );
                let rows = conn.query(&bound.sql, &bound.args).await.map_err(|source| {
                    TransactionError::statement(self.context.id(), &bound.sql, source)
                })?;
                TaskOutput::Rows(rows)
            }
        };
        drop(conn);

        *self.result.lock() = Some(output);
        Ok(self)
    }
}

#[async_trait]
impl<S: ConnectionSource> Executable for Task<S> {
    fn context(&self) -> Arc<dyn Context> {
        self.context.clone()
    }

    async fn exec(&self) -> TransactionResult<()> {
        Task::exec(self).await.map(|_| ())
    }

    fn result(&self) -> Option<TaskOutput> {
        Task::result(self)
    }
}

impl<S: ConnectionSource> fmt::Debug for Task<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Task");
        out.field("context", &self.context.id());
        match &self.kind {
            TaskKind::Sql(query) => out.field("sql", &query.template()),
            TaskKind::Callback(_) => out.field("callback", &".."),
        };
        out.field("params", &*self.params.lock()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::source::mock::{Event, MockConnection, MockSource};
    use crate::transaction::{ErrorKind, TransactionManager};
    use serde_json::json;

    fn setup() -> (MockSource, Arc<DbContext<MockSource>>, TransactionManager) {
        let source = MockSource::new();
        let ctx = Arc::new(DbContext::new(source.clone()));
        (source, ctx, TransactionManager::new())
    }

    fn last_query(source: &MockSource) -> Option<(String, Vec<serde_json::Value>)> {
        source.events().into_iter().rev().find_map(|e| match e {
            Event::Query { sql, args, .. } => Some((sql, args)),
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_registration_is_lazy() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_task(&manager, "DELETE FROM t");

        assert_eq!(manager.len(), 1);
        assert!(task.result().is_none());
        assert!(source.events().is_empty());
    }

    #[tokio::test]
    async fn test_exec_requires_active_context() {
        let (_, ctx, manager) = setup();
        let task = ctx.add_task(&manager, "DELETE FROM t");

        let err = task.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_sql_task_binds_named_parameters() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_task_with_params(
            &manager,
            "INSERT INTO t(id, name) VALUES (:id, :name)",
            Params::new().with("id", 1).with("name", "Dave"),
        );

        ctx.init().await.unwrap();
        task.exec().await.unwrap();

        assert_eq!(
            last_query(&source),
            Some((
                "INSERT INTO t(id, name) VALUES ($1, $2)".to_string(),
                vec![json!(1), json!("Dave")]
            ))
        );
        assert_eq!(task.rows(), Some(ResultSet::default()));
        assert_eq!(task.template(), Some("INSERT INTO t(id, name) VALUES (:id, :name)"));
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_before_backend() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_task_with_params(
            &manager,
            "INSERT INTO t(id, name) VALUES (:id, :name)",
            Params::new().with("id", 1),
        );

        ctx.init().await.unwrap();
        let err = task.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ParameterBinding);
        assert_eq!(source.statements(), vec!["BEGIN"]);
        assert!(task.result().is_none());
    }

    #[tokio::test]
    async fn test_deferred_params_evaluated_at_exec() {
        let (source, ctx, manager) = setup();
        let value = Arc::new(Mutex::new(json!(0)));
        let reader = value.clone();
        let task = ctx.add_task_with_params(
            &manager,
            "SELECT * FROM t WHERE id = :id",
            ParamSource::deferred(move || Params::new().with("id", reader.lock().clone())),
        );

        // Changed after registration, before exec.
        *value.lock() = json!(99);

        ctx.init().await.unwrap();
        task.exec().await.unwrap();
        assert_eq!(last_query(&source).map(|(_, args)| args), Some(vec![json!(99)]));
    }

    #[tokio::test]
    async fn test_set_params_replaces_source() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_task_with_params(&manager, "SELECT :id", Params::new().with("id", 1));
        task.set_params(Params::new().with("id", 2));

        ctx.init().await.unwrap();
        task.exec().await.unwrap();
        assert_eq!(last_query(&source).map(|(_, args)| args), Some(vec![json!(2)]));
    }

    #[tokio::test]
    async fn test_statement_failure_keeps_previous_result() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_task(&manager, "UPDATE t SET x = 1");

        ctx.init().await.unwrap();
        task.exec().await.unwrap();
        assert!(task.result().is_some());

        source.fail_statements("UPDATE");
        let err = task.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Statement);
        assert_eq!(task.result(), Some(TaskOutput::Rows(ResultSet::default())));
    }

    #[tokio::test]
    async fn test_callback_receives_live_connection() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_function_task(&manager, |conn: &mut MockConnection, task| {
            Box::pin(async move {
                conn.query("SELECT 1", &[]).await?;
                assert!(task.template().is_none());
                Ok::<_, BoxError>(TaskOutput::Value(json!({"done": true})))
            })
        });

        ctx.init().await.unwrap();
        task.exec().await.unwrap();

        assert_eq!(source.statements(), vec!["BEGIN", "SELECT 1"]);
        assert_eq!(task.result(), Some(TaskOutput::Value(json!({"done": true}))));
    }

    #[tokio::test]
    async fn test_callback_error_propagates() {
        let (_, ctx, manager) = setup();
        let task = ctx.add_function_task(&manager, |_conn, _task| {
            Box::pin(async { Err::<TaskOutput, BoxError>("boom".into()) })
        });

        ctx.init().await.unwrap();
        let err = task.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Callback);
        assert!(task.result().is_none());
    }

    #[tokio::test]
    async fn test_callback_can_inspect_its_own_context() {
        let (source, ctx, manager) = setup();
        let task = ctx.add_function_task(&manager, |_conn, task| {
            Box::pin(async move {
                let ctx = task.context();
                let lend_again = ctx.get_transaction().err().map(|err| err.kind());
                let commit = ctx.commit().await.err().map(|err| err.kind());
                Ok::<_, BoxError>(TaskOutput::Value(json!({
                    "initialized": ctx.is_initialized(),
                    "started": ctx.active_since().is_some(),
                    "lend_again_in_use": lend_again == Some(ErrorKind::InUse),
                    "commit_in_use": commit == Some(ErrorKind::InUse),
                })))
            })
        });

        ctx.init().await.unwrap();
        let run = tokio::time::timeout(Duration::from_secs(5), task.exec())
            .await
            .expect("callback blocked on its own context");
        assert!(run.is_ok());
        assert_eq!(
            task.result(),
            Some(TaskOutput::Value(json!({
                "initialized": true,
                "started": true,
                "lend_again_in_use": true,
                "commit_in_use": true,
            })))
        );

        // The lock is free again once the task is done.
        assert!(ctx.get_transaction().is_ok());
        ctx.commit().await.unwrap();
        assert_eq!(source.statements(), vec!["BEGIN", "COMMIT"]);
    }
}
