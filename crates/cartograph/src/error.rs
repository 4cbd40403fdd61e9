use crate::db::DbError;
use crate::reconcile::Failure;
use cartograph_schema::RelationDescriptor;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("schema blob for `{table}` could not be encoded: {source}")]
    Serialization {
        table: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("world table bootstrap failed: {0}")]
    Bootstrap(String),
}

/// A problem with the declared entities or relations.
///
/// These are reported, never fatal: the offending table or relation is
/// skipped and expansion continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    /// Table names must be at least two characters long.
    InvalidTableName(String),
    /// A relation names a table that is not declared.
    MissingTable { relation: String, table: String },
    /// A many-valued relation from a table to itself whose two sides share a
    /// role name, so both would land on one join column.
    AmbiguousSelfReference { relation: String },
    /// A column references a table that is not declared.
    DanglingForeignKey {
        table: String,
        column: String,
        target: String,
    },
}

impl DeclarationError {
    pub(crate) fn missing_table(relation: &RelationDescriptor, table: &str) -> Self {
        DeclarationError::MissingTable {
            relation: relation.to_string(),
            table: table.to_string(),
        }
    }
}

impl fmt::Display for DeclarationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclarationError::InvalidTableName(name) => {
                write!(f, "invalid table name `{}`: must be at least 2 characters", name)
            }
            DeclarationError::MissingTable { relation, table } => {
                write!(f, "relation `{}` references missing table `{}`", relation, table)
            }
            DeclarationError::AmbiguousSelfReference { relation } => write!(
                f,
                "relation `{}` joins a table to itself under one role name; give each side its own name",
                relation
            ),
            DeclarationError::DanglingForeignKey {
                table,
                column,
                target,
            } => write!(
                f,
                "column `{}.{}` references missing table `{}`",
                table, column, target
            ),
        }
    }
}

impl std::error::Error for DeclarationError {}

/// Error returned to the caller of a schema-edit action.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("no such table: {0}")]
    NoSuchTable(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("no such column: {table}.{column}")]
    NoSuchColumn { table: String, column: String },

    #[error("column already exists: {table}.{column}")]
    ColumnExists { table: String, column: String },

    #[error("{0} is a reserved word")]
    ReservedWord(String),

    #[error("{0} is a system column")]
    SystemColumn(String),

    #[error("invalid declaration: {0}")]
    Declaration(DeclarationError),

    #[error("statement failed: {}: {}", .0.sql, .0.error)]
    Ddl(Failure),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error(transparent)]
    Engine(#[from] Error),
}
