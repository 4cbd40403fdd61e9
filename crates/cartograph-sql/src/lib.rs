//! SQL dialects and DDL rendering.
//!
//! Everything in this crate is pure: functions take descriptors and return
//! SQL text. Deciding whether to run a statement is the reconciler's job.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod ddl;
pub use ddl::*;

mod types;
pub use types::*;

/// A supported SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(alias = "postgresql")]
    Postgres,
    Mysql,
    #[serde(alias = "sqlite3")]
    Sqlite,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Whether index and constraint names can be listed before creating them.
    pub fn has_index_catalog(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Whether foreign-key constraints are created at all.
    pub fn supports_foreign_keys(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Render a boolean literal.
    pub fn bool_lit(&self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Sqlite, true) => "1",
            (Dialect::Sqlite, false) => "0",
            (_, true) => "true",
            (_, false) => "false",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown dialect name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDialect(pub String);

impl fmt::Display for UnknownDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown dialect: {}", self.0)
    }
}

impl std::error::Error for UnknownDialect {}

impl FromStr for Dialect {
    type Err = UnknownDialect;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            _ => Err(UnknownDialect(s.to_string())),
        }
    }
}

/// A string literal wrapper.
///
/// Display writes the value escaped and quoted with single quotes. MySQL
/// also treats backslash as an escape character, so it gets doubled there.
///
/// # Example
/// ```
/// use cartograph_sql::{Dialect, Lit};
/// assert_eq!(format!("{}", Lit(Dialect::Postgres, "it's")), "'it''s'");
/// assert_eq!(format!("{}", Lit(Dialect::Mysql, r"a\b")), r"'a\\b'");
/// ```
pub struct Lit<'a>(pub Dialect, pub &'a str);

impl fmt::Display for Lit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'")?;
        for c in self.1.chars() {
            match c {
                '\'' => write!(f, "''")?,
                '\\' if self.0 == Dialect::Mysql => write!(f, "\\\\")?,
                c => write!(f, "{}", c)?,
            }
        }
        write!(f, "'")
    }
}

/// An identifier wrapper.
///
/// Display writes the value quoted for the dialect: backticks for MySQL,
/// double quotes elsewhere. Embedded quote characters are doubled.
///
/// # Example
/// ```
/// use cartograph_sql::{Dialect, Ident};
/// assert_eq!(format!("{}", Ident(Dialect::Postgres, "user")), "\"user\"");
/// assert_eq!(format!("{}", Ident(Dialect::Mysql, "user")), "`user`");
/// ```
pub struct Ident<'a>(pub Dialect, pub &'a str);

impl fmt::Display for Ident<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = match self.0 {
            Dialect::Mysql => '`',
            Dialect::Postgres | Dialect::Sqlite => '"',
        };
        write!(f, "{}", quote)?;
        for c in self.1.chars() {
            if c == quote {
                write!(f, "{}{}", quote, quote)?;
            } else {
                write!(f, "{}", c)?;
            }
        }
        write!(f, "{}", quote)
    }
}

fn hashed_name(prefix: &str, input: &str) -> String {
    let hex = blake3::hash(input.as_bytes()).to_hex().to_string();
    format!("{}{}", prefix, &hex[..16])
}

/// Deterministic name of the unique index on `table.column`.
pub fn unique_index_name(table: &str, column: &str) -> String {
    hashed_name("u", &format!("index_{}_{}_unique", table, column))
}

/// Deterministic name of the plain index on `table.column`.
pub fn index_name(table: &str, column: &str) -> String {
    hashed_name("i", &format!("index_{}_{}_index", table, column))
}

/// Deterministic name of a unique index spanning several columns.
pub fn composite_unique_name(table: &str, columns: &[impl AsRef<str>]) -> String {
    let cols: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    hashed_name("u", &format!("index_cl_{}_{}_unique", table, cols.join(",")))
}

/// Deterministic name of the foreign-key constraint on `table.column`.
pub fn foreign_key_name(table: &str, column: &str, ref_table: &str, ref_column: &str) -> String {
    hashed_name(
        "fk",
        &format!("{}_{}_{}_{}_fk", table, column, ref_table, ref_column),
    )
}
