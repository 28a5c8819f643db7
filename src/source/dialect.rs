//! Backend-specific SQL syntax.

use crate::transaction::IsolationLevel;

/// SQL dialect of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `$1, $2, ...` placeholders.
    Postgres,
    /// `?1, ?2, ...` placeholders.
    Sqlite,
}

impl Dialect {
    /// Positional placeholder for a 1-based position.
    pub fn placeholder(&self, position: usize) -> String {
        match self {
            Dialect::Postgres => format!("${position}"),
            Dialect::Sqlite => format!("?{position}"),
        }
    }

    /// Statement that opens a transaction.
    ///
    /// SQLite transactions are always serializable, so the level is not
    /// rendered there.
    pub fn begin_statement(&self, isolation: Option<IsolationLevel>) -> String {
        match (self, isolation) {
            (Dialect::Postgres, Some(level)) => format!("BEGIN ISOLATION LEVEL {level}"),
            _ => "BEGIN".to_string(),
        }
    }

    pub fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }

    pub fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }
}
