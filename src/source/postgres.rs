//! PostgreSQL through `sqlx`.
//!
//! Arguments arrive as JSON values, which say little about the column they
//! are meant for. Statements with arguments are described first, and each
//! argument is encoded as the parameter type the server inferred. Strings
//! with no better match (and every NULL) go out untyped, so the server's
//! inference stands.

use std::fmt::Display;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{json, Number, Value};
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::pool::PoolConnection;
use sqlx::postgres::types::{Oid, PgInterval};
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgConnection, PgPool, PgRow, PgTypeInfo};
use sqlx::query::Query;
use sqlx::types::{Decimal, Json, Uuid};
use sqlx::{Column, Either, Executor, Postgres, Row, Statement, Type, TypeInfo, ValueRef};

use super::{release_pooled, Connection, ConnectionSource, Dialect, Lease};
use crate::result::ResultSet;
use crate::BoxError;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[async_trait]
impl ConnectionSource for PgPool {
    type Connection = PoolConnection<Postgres>;

    async fn acquire(&self) -> Result<Lease<Self::Connection>, BoxError> {
        let conn = sqlx::Pool::acquire(self).await?;
        Ok(Lease::new(conn, release_pooled::<Postgres>))
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }
}

#[async_trait]
impl Connection for PoolConnection<Postgres> {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<ResultSet, BoxError> {
        // The described statement lands in the connection's statement cache,
        // so the query below runs it with these parameter types.
        let described = if args.is_empty() {
            None
        } else {
            Some(describe(&mut **self, sql).await?)
        };

        let mut query = sqlx::query(sql);
        for (index, value) in args.iter().enumerate() {
            let expected = described
                .as_ref()
                .and_then(|d| d.parameters.get(index))
                .map(String::as_str);
            query = bind_value(query, value, expected)?;
        }
        let rows = query.fetch_all(&mut **self).await?;

        let columns = match (rows.first(), described) {
            (Some(row), _) => column_names(row.columns()),
            (None, Some(described)) => described.columns,
            (None, None) => match describe(&mut **self, sql).await {
                Ok(described) => described.columns,
                Err(err) => {
                    tracing::debug!(error = %err, "could not describe statement columns");
                    Vec::new()
                }
            },
        };

        let mut set = ResultSet::new(columns);
        for row in &rows {
            set.push(decode_row(row)?);
        }
        Ok(set)
    }
}

/// Parameter type names and result columns of a prepared statement.
struct Described {
    parameters: Vec<String>,
    columns: Vec<String>,
}

async fn describe(conn: &mut PgConnection, sql: &str) -> Result<Described, sqlx::Error> {
    let statement = conn.prepare(sql).await?;
    let parameters = match statement.parameters() {
        Some(Either::Left(types)) => types.iter().map(|ty| ty.name().to_string()).collect(),
        _ => Vec::new(),
    };
    Ok(Described {
        parameters,
        columns: column_names(statement.columns()),
    })
}

fn column_names<C: Column>(columns: &[C]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// A text or NULL argument sent with the unspecified type (OID 0).
struct Untyped(Option<String>);

impl Type<Postgres> for Untyped {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for Untyped {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        match &self.0 {
            Some(text) => {
                buf.extend(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }
}

fn bind_value<'q>(
    query: PgQuery<'q>,
    value: &Value,
    expected: Option<&str>,
) -> Result<PgQuery<'q>, BoxError> {
    let expected = expected.unwrap_or_default();
    Ok(match value {
        Value::Null => query.bind(Untyped(None)),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => bind_number(query, n, expected)?,
        Value::String(s) => bind_text(query, s, expected)?,
        Value::Array(_) | Value::Object(_) => query.bind(Json(value.clone())),
    })
}

fn bind_number<'q>(query: PgQuery<'q>, n: &Number, expected: &str) -> Result<PgQuery<'q>, BoxError> {
    let integer = || {
        n.as_i64()
            .ok_or_else(|| BoxError::from(format!("{n} is not an integer, expected {expected}")))
    };
    let float = || n.as_f64().ok_or_else(|| BoxError::from(format!("{n} is out of range")));

    Ok(match expected {
        "INT2" => query.bind(i16::try_from(integer()?)?),
        "INT4" => query.bind(i32::try_from(integer()?)?),
        "INT8" => query.bind(integer()?),
        "OID" => query.bind(Oid(u32::try_from(integer()?)?)),
        "FLOAT4" => query.bind(float()? as f32),
        "FLOAT8" => query.bind(float()?),
        "NUMERIC" => query.bind(parse::<Decimal>(&n.to_string(), expected)?),
        "JSON" | "JSONB" => query.bind(Json(Value::Number(n.clone()))),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => query.bind(n.to_string()),
        _ => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(float()?),
        },
    })
}

fn bind_text<'q>(query: PgQuery<'q>, s: &str, expected: &str) -> Result<PgQuery<'q>, BoxError> {
    Ok(match expected {
        "TIMESTAMPTZ" => {
            let at = DateTime::parse_from_rfc3339(s)
                .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"));
            query.bind(convert(at, s, expected)?.with_timezone(&Utc))
        }
        "TIMESTAMP" => {
            let at = s
                .parse::<NaiveDateTime>()
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"));
            query.bind(convert(at, s, expected)?)
        }
        "DATE" => query.bind(parse::<NaiveDate>(s, expected)?),
        "TIME" => query.bind(parse::<NaiveTime>(s, expected)?),
        "UUID" => query.bind(parse::<Uuid>(s, expected)?),
        "NUMERIC" => query.bind(parse::<Decimal>(s, expected)?),
        "INT2" => query.bind(parse::<i16>(s, expected)?),
        "INT4" => query.bind(parse::<i32>(s, expected)?),
        "INT8" => query.bind(parse::<i64>(s, expected)?),
        "FLOAT4" => query.bind(parse::<f32>(s, expected)?),
        "FLOAT8" => query.bind(parse::<f64>(s, expected)?),
        "BOOL" => query.bind(parse::<bool>(s, expected)?),
        "JSON" | "JSONB" => query.bind(Json(Value::String(s.to_string()))),
        _ => query.bind(Untyped(Some(s.to_string()))),
    })
}

fn parse<T>(s: &str, expected: &str) -> Result<T, BoxError>
where
    T: FromStr,
    T::Err: Display,
{
    convert(s.parse::<T>(), s, expected)
}

fn convert<T, E: Display>(result: Result<T, E>, s: &str, expected: &str) -> Result<T, BoxError> {
    result.map_err(|err| format!("cannot bind {s:?} as {expected}: {err}").into())
}

fn decode_row(row: &PgRow) -> Result<Vec<Value>, BoxError> {
    row.columns()
        .iter()
        .map(|column| decode_value(row, column.ordinal(), column.type_info().name()))
        .collect()
}

fn decode_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value, BoxError> {
    if row.try_get_raw(index)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::from(row.try_get::<bool, _>(index)?),
        "INT2" => Value::from(row.try_get::<i16, _>(index)?),
        "INT4" => Value::from(row.try_get::<i32, _>(index)?),
        "INT8" => Value::from(row.try_get::<i64, _>(index)?),
        "OID" => Value::from(row.try_get::<Oid, _>(index)?.0),
        "FLOAT4" => Value::from(row.try_get::<f32, _>(index)?),
        "FLOAT8" => Value::from(row.try_get::<f64, _>(index)?),
        // Kept as a string so no precision is lost.
        "NUMERIC" => Value::from(row.try_get::<Decimal, _>(index)?.to_string()),
        "JSON" | "JSONB" => row.try_get::<Json<Value>, _>(index)?.0,
        "BYTEA" => Value::from(row.try_get::<Vec<u8>, _>(index)?),
        "UUID" => Value::from(row.try_get::<Uuid, _>(index)?.to_string()),
        "TIMESTAMPTZ" => Value::from(
            row.try_get::<DateTime<Utc>, _>(index)?
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        ),
        "TIMESTAMP" => Value::from(
            row.try_get::<NaiveDateTime, _>(index)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "DATE" => Value::from(row.try_get::<NaiveDate, _>(index)?.to_string()),
        "TIME" => Value::from(row.try_get::<NaiveTime, _>(index)?.to_string()),
        "INTERVAL" => {
            let interval = row.try_get::<PgInterval, _>(index)?;
            json!({
                "months": interval.months,
                "days": interval.days,
                "microseconds": interval.microseconds,
            })
        }
        "BOOL[]" => Value::from(row.try_get::<Vec<Option<bool>>, _>(index)?),
        "INT2[]" => Value::from(row.try_get::<Vec<Option<i16>>, _>(index)?),
        "INT4[]" => Value::from(row.try_get::<Vec<Option<i32>>, _>(index)?),
        "INT8[]" => Value::from(row.try_get::<Vec<Option<i64>>, _>(index)?),
        "FLOAT8[]" => Value::from(row.try_get::<Vec<Option<f64>>, _>(index)?),
        "TEXT[]" | "VARCHAR[]" => Value::from(row.try_get::<Vec<Option<String>>, _>(index)?),
        // TEXT, VARCHAR, BPCHAR, NAME, enums and anything else: the raw value
        // as text when it is valid UTF-8, its bytes otherwise.
        _ => {
            let raw = row.try_get_raw(index)?;
            match raw.as_str() {
                Ok(text) => Value::from(text),
                Err(_) => Value::from(raw.as_bytes()?.to_vec()),
            }
        }
    };
    Ok(value)
}
