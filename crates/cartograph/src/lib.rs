//! Schema synthesis and migration for a declarative backend.
//!
//! Applications describe their entities and the relations between them.
//! cartograph turns that description into a full relational schema and keeps
//! a live database in line with it:
//!
//! - [`expand`] materializes relations into foreign-key columns and join
//!   tables, and adds state, audit and translation companion tables.
//! - [`Reconciler`] compares the result with the live database and issues
//!   only additive DDL: missing tables, columns, indexes and constraints.
//! - [`WorldStore`] persists every table's descriptor in the world table, so
//!   the next boot starts from what was actually built.
//! - [`Engine`] runs all of that at startup, publishes an immutable
//!   [`SchemaSnapshot`], and serializes runtime schema edits.
//!
//! PostgreSQL, MySQL and SQLite are supported. DDL text is rendered by
//! `cartograph-sql`; the descriptor types live in `cartograph-schema`.
//!
//! ```ignore
//! let conn = SqliteConnection::open("app.db")?;
//! let (engine, report) = Engine::start(conn, EngineConfig::default(), declarations).await?;
//! assert!(report.reconcile.is_clean());
//! let project = engine.snapshot().table("project").cloned();
//! ```

pub mod config;
mod db;
mod edit;
mod engine;
mod error;
pub mod expand;
pub mod reconcile;
pub mod standard;
mod traced;
pub mod world;

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use config::{BootstrapPolicy, EngineConfig};
pub use db::{DbError, DbErrorKind, SqlValue};
pub use engine::{Declarations, Engine, SchemaSnapshot, StartupReport};
pub use error::{DeclarationError, EditError, Error};
pub use expand::{ExpandOptions, Expansion, expand};
pub use reconcile::{
    Change, Failure, Plan, ReconcileReport, Reconciler, SegmentMode, TableDiff,
};
pub use traced::{BoxFuture, Connection, ConnectionExt, TracedConn};
pub use world::{SyncReport, WorldRecord, WorldStore};

#[cfg(feature = "mysql")]
pub use mysql::MySqlConnection;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConnection;

pub use cartograph_schema::*;
pub use cartograph_sql::Dialect;
