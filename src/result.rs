//! Task result types.

use serde_json::Value;

/// What a task leaves behind after a successful `exec`.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutput {
    /// Rows returned by a SQL task.
    Rows(ResultSet),
    /// A value produced by a callback.
    Value(Value),
    /// A callback that produced nothing.
    Unit,
}

impl TaskOutput {
    /// Borrow the rows, if this output came from a statement.
    pub fn as_rows(&self) -> Option<&ResultSet> {
        match self {
            TaskOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Take the rows, if this output came from a statement.
    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            TaskOutput::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Borrow the callback value.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            TaskOutput::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Check if the output carries nothing.
    pub fn is_unit(&self) -> bool {
        matches!(self, TaskOutput::Unit)
    }
}

impl From<ResultSet> for TaskOutput {
    fn from(rows: ResultSet) -> Self {
        TaskOutput::Rows(rows)
    }
}

impl From<Value> for TaskOutput {
    fn from(value: Value) -> Self {
        TaskOutput::Value(value)
    }
}

impl From<()> for TaskOutput {
    fn from(_: ()) -> Self {
        TaskOutput::Unit
    }
}

/// A set of rows returned by a statement.
///
/// Each row is aligned with `columns`. Columns are taken from the statement,
/// so they are known even when no rows come back, and a name may repeat
/// (`SELECT a.id, b.id ...`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column names in driver order.
    pub columns: Vec<String>,
    /// Row values, positionally matching `columns`.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create a new empty result set.
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns, rows: Vec::new() }
    }

    /// Add a row.
    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Position of the first column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Get a row by index.
    pub fn get(&self, index: usize) -> Option<&[Value]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Get a single cell by column name. With duplicate names, the first
    /// column wins; use [`cell`](Self::cell) to reach the others.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        self.cell(row, self.column_index(column)?)
    }

    /// Get a single cell by position.
    pub fn cell(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &[Value]> {
        self.rows.iter().map(Vec::as_slice)
    }
}

impl IntoIterator for ResultSet {
    type Item = Vec<Value>;
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
