//! Scripted connection source for lifecycle tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use super::{Connection, ConnectionSource, Dialect, Lease, Release};
use crate::result::ResultSet;
use crate::BoxError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Event {
    Acquire(usize),
    Query { conn: usize, sql: String, args: Vec<Value> },
    Release { conn: usize, how: Release },
}

#[derive(Debug, Default)]
struct Script {
    events: Mutex<Vec<Event>>,
    next_conn: AtomicUsize,
    fail_acquire: AtomicBool,
    failing_prefixes: Mutex<Vec<String>>,
}

/// Source that records every acquire, statement and release.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSource {
    script: Arc<Script>,
}

#[derive(Debug)]
pub(crate) struct MockConnection {
    id: usize,
    script: Arc<Script>,
}

impl MockSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.script.events.lock().clone()
    }

    pub(crate) fn fail_acquire(&self, fail: bool) {
        self.script.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Make every statement starting with `prefix` fail.
    pub(crate) fn fail_statements(&self, prefix: &str) {
        self.script.failing_prefixes.lock().push(prefix.to_string());
    }

    pub(crate) fn acquires(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Acquire(_)))
            .count()
    }

    pub(crate) fn releases(&self) -> Vec<(usize, Release)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Release { conn, how } => Some((conn, how)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn statements(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Query { sql, .. } => Some(sql),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ConnectionSource for MockSource {
    type Connection = MockConnection;

    async fn acquire(&self) -> Result<Lease<MockConnection>, BoxError> {
        if self.script.fail_acquire.load(Ordering::SeqCst) {
            return Err("pool exhausted".into());
        }
        let id = self.script.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.events.lock().push(Event::Acquire(id));

        let conn = MockConnection {
            id,
            script: self.script.clone(),
        };
        Ok(Lease::new(conn, |conn: MockConnection, how| {
            conn.script
                .events
                .lock()
                .push(Event::Release { conn: conn.id, how });
        }))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<ResultSet, BoxError> {
        self.script.events.lock().push(Event::Query {
            conn: self.id,
            sql: sql.to_string(),
            args: args.to_vec(),
        });

        let fails = self
            .script
            .failing_prefixes
            .lock()
            .iter()
            .any(|prefix| sql.starts_with(prefix.as_str()));
        if fails {
            return Err(format!("mock failure: {sql}").into());
        }
        Ok(ResultSet::default())
    }
}
