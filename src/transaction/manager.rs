//! Transaction manager - runs a unit of work across contexts.
//!
//! Tasks are registered through their contexts and executed here in
//! registration order. The manager handles:
//! - Opening each context the first time one of its tasks runs
//! - Rolling back every context it touched when a task fails
//! - Committing those contexts in order when every task succeeds

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Span;

use crate::transaction::error::TransactionResult;
use crate::transaction::traits::{Context, Executable};

/// Sequences registered tasks and decides the final commit or rollback.
pub struct TransactionManager {
    tasks: Mutex<Vec<Arc<dyn Executable>>>,
    span: Span,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            span: tracing::info_span!("mtxn.manager"),
        }
    }

    /// Record lifecycle events under `span` instead of the default one.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Append a task. Usually called through a context's `add_task`.
    pub fn add_task(&self, task: Arc<dyn Executable>) {
        self.tasks.lock().push(task);
    }

    /// Snapshot of the registered tasks, in order.
    pub fn tasks(&self) -> Vec<Arc<dyn Executable>> {
        self.tasks.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Run every registered task and settle the contexts.
    ///
    /// The registered tasks are consumed, so the manager can be reused for
    /// the next unit of work. On failure every touched context has been
    /// rolled back by the time this returns.
    pub async fn exec(&self) -> TransactionResult<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        tracing::debug!(parent: &self.span, tasks = tasks.len(), "executing unit of work");

        let mut touched: Vec<Arc<dyn Context>> = Vec::new();
        for (index, task) in tasks.iter().enumerate() {
            let context = task.context();
            if !touched.iter().any(|seen| seen.id() == context.id()) {
                if !context.is_initialized() {
                    if let Err(err) = context.init().await {
                        tracing::warn!(parent: &self.span, context = %context.name(), error = %err, "init failed");
                        self.rollback_all(&touched).await;
                        return Err(err);
                    }
                }
                touched.push(context);
            }

            if let Err(err) = task.exec().await {
                tracing::warn!(parent: &self.span, task = index, error = %err, "task failed, rolling back");
                self.rollback_all(&touched).await;
                return Err(err);
            }
        }

        for (position, context) in touched.iter().enumerate() {
            if let Err(err) = context.commit().await {
                tracing::error!(parent: &self.span, context = %context.name(), error = %err, "commit failed");
                self.rollback_all(&touched[position + 1..]).await;
                return Err(err);
            }
        }

        tracing::debug!(parent: &self.span, contexts = touched.len(), "unit of work committed");
        Ok(())
    }

    // Reverse order; failures are logged and do not stop the remaining rollbacks.
    async fn rollback_all(&self, contexts: &[Arc<dyn Context>]) {
        for context in contexts.iter().rev() {
            if let Err(err) = context.rollback().await {
                tracing::error!(parent: &self.span, context = %context.name(), error = %err, "rollback failed");
            }
        }
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("tasks", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use crate::result::TaskOutput;
    use crate::source::mock::MockSource;
    use crate::source::{PoolConfig, Release};
    use crate::transaction::{DbContext, ErrorKind, FunctionContext, FunctionTask};
    use crate::BoxError;
    use serde_json::json;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    async fn pool(dir: &TempDir) -> SqlitePool {
        let url = format!("sqlite://{}", dir.path().join("mtxn.db").display());
        let pool = PoolConfig::new(url)
            .max_connections(2)
            .connect_sqlite()
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (id, name) VALUES (5, 'Seed')")
            .execute(&pool)
            .await
            .unwrap();
        pool
    }

    async fn names(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar::<_, String>("SELECT name FROM t ORDER BY id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_path_runs_all_tasks() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let manager = TransactionManager::new();
        let db = Arc::new(DbContext::new(pool.clone()));
        let func = Arc::new(FunctionContext::new());

        db.add_task(&manager, "DELETE FROM t");
        db.add_task_with_params(
            &manager,
            "INSERT INTO t(id, name) VALUES (:id, :name)",
            Params::new().with("id", 1).with("name", "Dave"),
        );
        let noop = func.add_task(&manager, |_task: &FunctionTask| {
            Box::pin(async { Ok(TaskOutput::Unit) })
        });

        manager.exec().await.unwrap();

        assert!(manager.is_empty());
        assert!(!db.is_initialized());
        assert!(!func.is_initialized());
        assert_eq!(noop.result(), Some(TaskOutput::Unit));
        assert_eq!(names(&pool).await, vec!["Dave"]);
    }

    #[tokio::test]
    async fn test_failing_statement_rolls_everything_back() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let manager = TransactionManager::new();
        let db = Arc::new(DbContext::new(pool.clone()));
        let func = Arc::new(FunctionContext::new());

        let dave = Params::new().with("id", 1).with("name", "Dave");
        db.add_task(&manager, "DELETE FROM t");
        db.add_task_with_params(&manager, "INSERT INTO t(id, name) VALUES (:id, :name)", dave.clone());
        db.add_task_with_params(&manager, "INSERT INTO t(id, name) VALUES (:id, :name)", dave);
        let never = func.add_task(&manager, |_task: &FunctionTask| {
            Box::pin(async { Ok(TaskOutput::Unit) })
        });

        let err = manager.exec().await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Statement);
        assert_eq!(err.context_id(), Some(db.id()));
        assert!(!db.is_initialized());
        assert!(never.result().is_none());
        assert_eq!(names(&pool).await, vec!["Seed"]);
    }

    #[tokio::test]
    async fn test_callback_and_statement_share_transaction() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let manager = TransactionManager::new();
        let db = Arc::new(DbContext::new(pool.clone()));

        db.add_function_task(&manager, |conn, _task| {
            Box::pin(async move {
                let done = sqlx::query("INSERT INTO t (id, name) VALUES (?1, ?2)")
                    .bind(2_i64)
                    .bind("Stuart")
                    .execute(&mut **conn)
                    .await?;
                Ok::<_, BoxError>(TaskOutput::Value(json!(done.rows_affected())))
            })
        });
        let select = db.add_task(&manager, "SELECT * FROM t ORDER BY id");

        manager.exec().await.unwrap();

        let rows = select.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.value(0, "name"), Some(&json!("Stuart")));
        assert_eq!(names(&pool).await, vec!["Stuart", "Seed"]);
    }

    #[tokio::test]
    async fn test_deferred_params_see_earlier_results() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let manager = TransactionManager::new();
        let db = Arc::new(DbContext::new(pool.clone()));

        let lookup = db.add_task(&manager, "SELECT id FROM t WHERE name = 'Seed'");
        let reader = lookup.clone();
        db.add_task_with_params(
            &manager,
            "UPDATE t SET name = :name WHERE id = :id",
            crate::params::ParamSource::deferred(move || {
                let id = reader
                    .rows()
                    .and_then(|rows| rows.value(0, "id").cloned())
                    .unwrap_or_default();
                Params::new().with("id", id).with("name", "Renamed")
            }),
        );

        manager.exec().await.unwrap();
        assert_eq!(names(&pool).await, vec!["Renamed"]);
    }

    #[tokio::test]
    async fn test_contexts_commit_in_order_and_roll_back_in_reverse() {
        let first = MockSource::new();
        let second = MockSource::new();
        let manager = TransactionManager::new();
        let a = Arc::new(DbContext::new(first.clone()));
        let b = Arc::new(DbContext::new(second.clone()));

        a.add_task(&manager, "SELECT 1");
        b.add_task(&manager, "SELECT 2");
        a.add_task(&manager, "SELECT 3");
        manager.exec().await.unwrap();

        assert_eq!(first.statements(), vec!["BEGIN", "SELECT 1", "SELECT 3", "COMMIT"]);
        assert_eq!(second.statements(), vec!["BEGIN", "SELECT 2", "COMMIT"]);
        assert_eq!(first.acquires(), 1);

        second.fail_statements("SELECT 4");
        a.add_task(&manager, "SELECT 1");
        b.add_task(&manager, "SELECT 4");
        let err = manager.exec().await.unwrap_err();

        assert_eq!(err.context_id(), Some(b.id()));
        assert_eq!(first.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(second.statements().last().map(String::as_str), Some("ROLLBACK"));
        assert_eq!(first.releases(), vec![(1, Release::Reuse), (2, Release::Reuse)]);
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_remaining_contexts() {
        let first = MockSource::new();
        let second = MockSource::new();
        let manager = TransactionManager::new();
        let a = Arc::new(DbContext::new(first.clone()));
        let b = Arc::new(DbContext::new(second.clone()));

        a.add_task(&manager, "SELECT 1");
        b.add_task(&manager, "SELECT 2");
        first.fail_statements("COMMIT");

        let err = manager.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Statement);
        assert_eq!(first.releases(), vec![(1, Release::Discard)]);
        assert_eq!(second.statements(), vec!["BEGIN", "SELECT 2", "ROLLBACK"]);
        assert!(!b.is_initialized());
    }

    #[tokio::test]
    async fn test_acquisition_failure_rolls_back_earlier_contexts() {
        let first = MockSource::new();
        let second = MockSource::new();
        let manager = TransactionManager::new();
        let a = Arc::new(DbContext::new(first.clone()));
        let b = Arc::new(DbContext::new(second.clone()));

        a.add_task(&manager, "SELECT 1");
        b.add_task(&manager, "SELECT 2");
        second.fail_acquire(true);

        let err = manager.exec().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        assert_eq!(first.statements(), vec!["BEGIN", "SELECT 1", "ROLLBACK"]);
        assert!(second.events().is_empty());
    }

    #[tokio::test]
    async fn test_already_active_context_is_settled() {
        let source = MockSource::new();
        let manager = TransactionManager::new();
        let ctx = Arc::new(DbContext::new(source.clone()));
        ctx.init().await.unwrap();

        ctx.add_task(&manager, "SELECT 1");
        manager.exec().await.unwrap();

        assert_eq!(source.statements(), vec!["BEGIN", "SELECT 1", "COMMIT"]);
        assert!(!ctx.is_initialized());
    }
}
