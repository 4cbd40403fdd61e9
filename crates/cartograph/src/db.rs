//! Backend-neutral values and errors.

use std::fmt;

/// A single value read back from a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl SqlValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Int(v) => Some(*v),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Text(s) => s.trim().parse().ok(),
            SqlValue::Float(_) | SqlValue::Null => None,
        }
    }

    /// Booleans come back as integers from SQLite and MySQL.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::Int(v) => Some(*v != 0),
            SqlValue::Text(s) => match s.as_str() {
                "t" | "true" | "1" => Some(true),
                "f" | "false" | "0" => Some(false),
                _ => None,
            },
            SqlValue::Float(_) | SqlValue::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Whether a failed statement hit an object that is already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    AlreadyExists,
    Other,
}

/// An error reported by the database or its driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a driver message that carries no structured code.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if lower.contains("already exists")
            || lower.contains("duplicate column")
            || lower.contains("duplicate key name")
            || lower.contains("duplicate foreign key")
        {
            DbErrorKind::AlreadyExists
        } else {
            DbErrorKind::Other
        };
        Self { kind, message }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == DbErrorKind::AlreadyExists
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DbError {}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> Self {
        use tokio_postgres::error::SqlState;

        let Some(db) = e.as_db_error() else {
            return DbError::new(DbErrorKind::Other, e.to_string());
        };
        let code = db.code();
        let kind = if code == &SqlState::DUPLICATE_TABLE
            || code == &SqlState::DUPLICATE_OBJECT
            || code == &SqlState::DUPLICATE_COLUMN
            || code == &SqlState::DUPLICATE_SCHEMA
        {
            DbErrorKind::AlreadyExists
        } else {
            DbErrorKind::Other
        };
        DbError::new(kind, format!("{} ({})", db.message(), code.code()))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DbError {
    fn from(e: rusqlite::Error) -> Self {
        DbError::from_message(e.to_string())
    }
}

#[cfg(feature = "mysql")]
impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        DbError::from_message(e.to_string())
    }
}
