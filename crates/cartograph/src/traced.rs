//! Database connections and query tracing.
//!
//! The engine talks to every backend through [`Connection`]. Statements are
//! plain SQL text with literals already inlined; nothing is bound.

use crate::db::{DbError, SqlValue};
use cartograph_sql::Dialect;
use std::future::Future;
use std::pin::Pin;
use tracing::Instrument;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for database connections the engine can drive.
///
/// This is implemented for `tokio_postgres::Client`, `deadpool_postgres::Object`,
/// [`SqliteConnection`](crate::SqliteConnection) and, with the `mysql` feature,
/// `MySqlConnection`.
pub trait Connection: Send + Sync {
    /// The dialect statements must be rendered in.
    fn dialect(&self) -> Dialect;

    /// Execute a statement, returning the number of rows affected.
    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, DbError>>;

    /// Execute a query, returning all rows.
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Vec<SqlValue>>, DbError>>;

    /// Prepare a query and return its result column names without reading rows.
    fn columns<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<String>, DbError>>;
}

/// A wrapper around a connection that logs all statements via tracing.
///
/// # Example
///
/// ```ignore
/// use cartograph::ConnectionExt;
///
/// let affected = conn.traced().execute("DROP TABLE \"note\"").await?;
/// ```
pub struct TracedConn<'a, C: Connection + ?Sized> {
    conn: &'a C,
}

impl<'a, C: Connection + ?Sized> TracedConn<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&self, sql: &str) -> Result<u64, DbError> {
        let span = tracing::debug_span!(
            "db.execute",
            sql = %sql,
            affected = tracing::field::Empty,
        );
        let affected = self.conn.execute(sql).instrument(span.clone()).await?;
        span.record("affected", affected);
        Ok(affected)
    }

    /// Execute a query, returning all rows.
    pub async fn query(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, DbError> {
        let span = tracing::debug_span!(
            "db.query",
            sql = %sql,
            rows = tracing::field::Empty,
        );
        let rows = self.conn.query(sql).instrument(span.clone()).await?;
        span.record("rows", rows.len());
        Ok(rows)
    }

    /// Describe a query's result columns.
    pub async fn columns(&self, sql: &str) -> Result<Vec<String>, DbError> {
        let span = tracing::debug_span!("db.describe", sql = %sql);
        self.conn.columns(sql).instrument(span).await
    }
}

/// Extension trait to get a traced wrapper from a connection.
pub trait ConnectionExt: Connection {
    /// Wrap this connection in a `TracedConn` for statement logging.
    fn traced(&self) -> TracedConn<'_, Self> {
        TracedConn::new(self)
    }
}

impl<C: Connection + ?Sized> ConnectionExt for C {}

fn pg_value(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue, tokio_postgres::Error> {
    use tokio_postgres::types::Type;

    let ty = row.columns()[idx].type_();
    let value = if ty == &Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::Bool)
    } else if ty == &Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| SqlValue::Int(v.into()))
    } else if ty == &Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| SqlValue::Int(v.into()))
    } else if ty == &Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
    } else if ty == &Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?
            .map(|v| SqlValue::Float(v.into()))
    } else if ty == &Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float)
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

async fn pg_execute(client: &tokio_postgres::Client, sql: &str) -> Result<u64, DbError> {
    Ok(client.execute(sql, &[]).await?)
}

async fn pg_query(
    client: &tokio_postgres::Client,
    sql: &str,
) -> Result<Vec<Vec<SqlValue>>, DbError> {
    let rows = client.query(sql, &[]).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        let values = (0..row.len())
            .map(|idx| pg_value(row, idx))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(values);
    }
    Ok(out)
}

async fn pg_columns(client: &tokio_postgres::Client, sql: &str) -> Result<Vec<String>, DbError> {
    let statement = client.prepare(sql).await?;
    Ok(statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect())
}

impl Connection for tokio_postgres::Client {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, DbError>> {
        Box::pin(pg_execute(self, sql))
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Vec<SqlValue>>, DbError>> {
        Box::pin(pg_query(self, sql))
    }

    fn columns<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<String>, DbError>> {
        Box::pin(pg_columns(self, sql))
    }
}

impl Connection for deadpool_postgres::Object {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, DbError>> {
        // Deref to the underlying Client to avoid recursion
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(pg_execute(client, sql))
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Vec<SqlValue>>, DbError>> {
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(pg_query(client, sql))
    }

    fn columns<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<String>, DbError>> {
        use std::ops::Deref;
        let client: &tokio_postgres::Client = self.deref();
        Box::pin(pg_columns(client, sql))
    }
}
