//! SQLite through `sqlx`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::types::Json;
use sqlx::{Column, Executor, Row, Sqlite, SqlitePool, Statement, TypeInfo, ValueRef};

use super::{release_pooled, Connection, ConnectionSource, Dialect, Lease};
use crate::result::ResultSet;
use crate::BoxError;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

#[async_trait]
impl ConnectionSource for SqlitePool {
    type Connection = PoolConnection<Sqlite>;

    async fn acquire(&self) -> Result<Lease<Self::Connection>, BoxError> {
        let conn = sqlx::Pool::acquire(self).await?;
        Ok(Lease::new(conn, release_pooled::<Sqlite>))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }
}

#[async_trait]
impl Connection for PoolConnection<Sqlite> {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<ResultSet, BoxError> {
        let query = args.iter().fold(sqlx::query(sql), bind_value);
        let rows = query.fetch_all(&mut **self).await?;

        let columns = match rows.first() {
            Some(row) => column_names(row.columns()),
            None => match (&mut **self).prepare(sql).await {
                Ok(statement) => column_names(statement.columns()),
                Err(err) => {
                    tracing::debug!(error = %err, "could not describe statement columns");
                    Vec::new()
                }
            },
        };
        Ok(decode_rows(columns, &rows)?)
    }
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        Value::Array(_) | Value::Object(_) => query.bind(Json(value.clone())),
    }
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

fn decode_rows(columns: Vec<String>, rows: &[SqliteRow]) -> Result<ResultSet, sqlx::Error> {
    let mut set = ResultSet::new(columns);
    for row in rows {
        set.push(decode_row(row)?);
    }
    Ok(set)
}

// SQLite is dynamically typed; decode by the storage class of each value
// rather than the declared column type.
fn decode_row(row: &SqliteRow) -> Result<Vec<Value>, sqlx::Error> {
    let mut out = Vec::with_capacity(row.len());
    for index in 0..row.len() {
        let storage = {
            let raw = row.try_get_raw(index)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        out.push(match storage.as_deref() {
            None => Value::Null,
            Some("INTEGER") => Value::from(row.try_get::<i64, _>(index)?),
            Some("REAL") => Value::from(row.try_get::<f64, _>(index)?),
            Some("BLOB") => Value::from(row.try_get::<Vec<u8>, _>(index)?),
            Some(_) => Value::from(row.try_get::<String, _>(index)?),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PoolConfig;
    use serde_json::json;
    use tempfile::TempDir;

    async fn pool(dir: &TempDir) -> SqlitePool {
        let url = format!("sqlite://{}", dir.path().join("source.db").display());
        PoolConfig::new(url).max_connections(2).connect_sqlite().await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_types() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let mut lease = ConnectionSource::acquire(&pool).await.unwrap();
        let conn = lease.connection().unwrap();

        conn.query(
            "CREATE TABLE sample (i INTEGER, r REAL, t TEXT, b BLOB, n TEXT)",
            &[],
        )
        .await
        .unwrap();
        conn.query(
            "INSERT INTO sample VALUES (?1, ?2, ?3, X'0102', ?4)",
            &[json!(3), json!(1.5), json!("x"), Value::Null],
        )
        .await
        .unwrap();

        let rows = conn.query("SELECT * FROM sample", &[]).await.unwrap();
        assert_eq!(rows.columns, vec!["i", "r", "t", "b", "n"]);
        assert_eq!(rows.value(0, "i"), Some(&json!(3)));
        assert_eq!(rows.value(0, "r"), Some(&json!(1.5)));
        assert_eq!(rows.value(0, "t"), Some(&json!("x")));
        assert_eq!(rows.value(0, "b"), Some(&json!([1, 2])));
        assert_eq!(rows.value(0, "n"), Some(&Value::Null));

        lease.release(crate::source::Release::Reuse);
    }

    #[tokio::test]
    async fn test_statement_error_surfaces() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let mut lease = ConnectionSource::acquire(&pool).await.unwrap();
        let conn = lease.connection().unwrap();

        let err = conn.query("SELECT * FROM missing_table", &[]).await.unwrap_err();
        assert!(err.to_string().contains("missing_table"));
        lease.release(crate::source::Release::Discard);
    }

    #[tokio::test]
    async fn test_columns_survive_duplicates_and_empty_results() {
        let dir = TempDir::new().unwrap();
        let pool = pool(&dir).await;
        let mut lease = ConnectionSource::acquire(&pool).await.unwrap();
        let conn = lease.connection().unwrap();

        conn.query("CREATE TABLE a (id INTEGER, name TEXT)", &[]).await.unwrap();
        conn.query("CREATE TABLE b (id INTEGER, a_id INTEGER)", &[]).await.unwrap();
        conn.query("INSERT INTO a VALUES (1, 'x')", &[]).await.unwrap();
        conn.query("INSERT INTO b VALUES (7, 1)", &[]).await.unwrap();

        let joined = conn
            .query("SELECT a.id, b.id FROM a JOIN b ON b.a_id = a.id", &[])
            .await
            .unwrap();
        assert_eq!(joined.columns, vec!["id", "id"]);
        assert_eq!(joined.get(0), Some(&[json!(1), json!(7)][..]));

        let empty = conn
            .query("SELECT id, name FROM a WHERE id = ?1", &[json!(42)])
            .await
            .unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.columns, vec!["id", "name"]);

        lease.release(crate::source::Release::Reuse);
    }
}
