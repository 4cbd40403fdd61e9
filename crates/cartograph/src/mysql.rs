//! MySQL backend over sqlx.

use crate::db::{DbError, SqlValue};
use crate::traced::{BoxFuture, Connection};
use cartograph_sql::Dialect;
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Connection as _, Executor, Row, Statement};
use tokio::sync::Mutex;

/// A single MySQL connection.
///
/// Statements are sent over the text protocol, since several DDL and
/// transaction-control statements cannot be prepared.
pub struct MySqlConnection {
    inner: Mutex<sqlx::MySqlConnection>,
}

impl MySqlConnection {
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let conn = sqlx::MySqlConnection::connect(url).await?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: sqlx::MySqlConnection) -> Self {
        Self {
            inner: Mutex::new(conn),
        }
    }

    async fn execute_now(&self, sql: &str) -> Result<u64, DbError> {
        let mut conn = self.inner.lock().await;
        let result = sqlx::raw_sql(sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn query_now(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, DbError> {
        let mut conn = self.inner.lock().await;
        let rows = sqlx::raw_sql(sql).fetch_all(&mut *conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn columns_now(&self, sql: &str) -> Result<Vec<String>, DbError> {
        let mut conn = self.inner.lock().await;
        let statement = (&mut *conn).prepare(sql).await?;
        Ok(statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect())
    }
}

fn decode_row(row: &MySqlRow) -> Result<Vec<SqlValue>, DbError> {
    (0..row.len()).map(|idx| decode_value(row, idx)).collect()
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<SqlValue, DbError> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(SqlValue::Int).unwrap_or(SqlValue::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(SqlValue::Float).unwrap_or(SqlValue::Null));
    }
    let v = row.try_get::<Option<String>, _>(idx)?;
    Ok(v.map(SqlValue::Text).unwrap_or(SqlValue::Null))
}

impl Connection for MySqlConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, DbError>> {
        Box::pin(self.execute_now(sql))
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Vec<SqlValue>>, DbError>> {
        Box::pin(self.query_now(sql))
    }

    fn columns<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<String>, DbError>> {
        Box::pin(self.columns_now(sql))
    }
}
