//! Transaction isolation levels.
//!
//! A context may ask for a specific level when it opens its transaction.
//! Left unset, the backend default applies (READ COMMITTED on PostgreSQL).

use std::fmt;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Parse isolation level from string (SQL syntax).
impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "READ UNCOMMITTED" | "READ_UNCOMMITTED" | "READUNCOMMITTED" => {
                Ok(IsolationLevel::ReadUncommitted)
            }
            "READ COMMITTED" | "READ_COMMITTED" | "READCOMMITTED" => {
                Ok(IsolationLevel::ReadCommitted)
            }
            "REPEATABLE READ" | "REPEATABLE_READ" | "REPEATABLEREAD" => {
                Ok(IsolationLevel::RepeatableRead)
            }
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
