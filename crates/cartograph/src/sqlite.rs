//! SQLite backend over rusqlite.

use crate::db::{DbError, SqlValue};
use crate::traced::{BoxFuture, Connection};
use cartograph_sql::Dialect;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use std::path::Path;
use std::sync::Arc;

/// A shared SQLite connection.
///
/// Clones share the same underlying database, which keeps in-memory
/// databases alive across engine restarts in tests.
#[derive(Clone)]
pub struct SqliteConnection {
    inner: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteConnection {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        Ok(Self::from_connection(rusqlite::Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, DbError> {
        Ok(Self::from_connection(rusqlite::Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: rusqlite::Connection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    fn execute_now(&self, sql: &str) -> Result<u64, DbError> {
        let conn = self.inner.lock();
        let affected = conn.execute(sql, [])?;
        Ok(affected as u64)
    }

    fn query_now(&self, sql: &str) -> Result<Vec<Vec<SqlValue>>, DbError> {
        let conn = self.inner.lock();
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(match row.get_ref(idx)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(v) => SqlValue::Int(v),
                    ValueRef::Real(v) => SqlValue::Float(v),
                    ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                        SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
                    }
                });
            }
            out.push(values);
        }
        Ok(out)
    }

    fn columns_now(&self, sql: &str) -> Result<Vec<String>, DbError> {
        let conn = self.inner.lock();
        let stmt = conn.prepare(sql)?;
        Ok(stmt.column_names().into_iter().map(String::from).collect())
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<u64, DbError>> {
        Box::pin(std::future::ready(self.execute_now(sql)))
    }

    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<Vec<SqlValue>>, DbError>> {
        Box::pin(std::future::ready(self.query_now(sql)))
    }

    fn columns<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<Vec<String>, DbError>> {
        Box::pin(std::future::ready(self.columns_now(sql)))
    }
}
