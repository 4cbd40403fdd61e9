//! Live-schema reconciliation.
//!
//! Compares expanded tables against what the database actually has and
//! issues the DDL needed to close the gap. Reconciliation only ever adds:
//! tables, columns, indexes and foreign keys. Nothing is dropped or altered.
//!
//! Statements run in three phases so that every referenced table exists
//! before a constraint points at it:
//!
//! 1. `CREATE TABLE` and `ADD COLUMN`
//! 2. `CREATE INDEX`
//! 3. `ADD CONSTRAINT ... FOREIGN KEY`
//!
//! Each statement runs in its own segment, so one failure does not take the
//! rest down with it. Failures whose cause is "already exists" are
//! tolerated; anything else is recorded in the [`ReconcileReport`].

use crate::db::DbError;
use crate::standard::effective_columns;
use crate::traced::{Connection, ConnectionExt};
use cartograph_schema::{ColumnDescriptor, ForeignKeyDescriptor, TableDescriptor};
use cartograph_sql::{
    Dialect, add_column_sql, add_foreign_key_sql, composite_unique_name, create_index_sql,
    create_table_sql, foreign_key_name, index_catalog_sql, index_name, probe_table_sql,
    unique_index_name,
};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

/// How statements are isolated from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    /// No surrounding transaction: each statement gets its own `BEGIN`/`COMMIT`.
    Startup,
    /// Inside a caller's transaction: each statement gets a savepoint.
    ///
    /// MySQL commits implicitly around every DDL statement and discards its
    /// savepoints, so there statements run bare.
    Atomic,
}

/// Runs statements in isolated segments.
pub(crate) struct Segments {
    mode: SegmentMode,
    seq: AtomicU32,
}

impl Segments {
    pub(crate) fn new(mode: SegmentMode) -> Self {
        Self {
            mode,
            seq: AtomicU32::new(0),
        }
    }

    /// Run `work` so that its failure leaves the surrounding transaction usable.
    ///
    /// The outer error is a failure of the segment control statements
    /// themselves; the inner result is the work's own outcome.
    pub(crate) async fn guard<C, T, F>(
        &self,
        conn: &C,
        work: F,
    ) -> Result<Result<T, DbError>, DbError>
    where
        C: Connection + ?Sized,
        F: Future<Output = Result<T, DbError>>,
    {
        if self.mode == SegmentMode::Startup || conn.dialect() == Dialect::Mysql {
            return Ok(work.await);
        }

        let traced = conn.traced();
        let savepoint = format!("cartograph_sp_{}", self.seq.fetch_add(1, Ordering::Relaxed));
        traced.execute(&format!("SAVEPOINT {}", savepoint)).await?;
        let result = work.await;
        if result.is_err() {
            traced
                .execute(&format!("ROLLBACK TO SAVEPOINT {}", savepoint))
                .await?;
        }
        traced
            .execute(&format!("RELEASE SAVEPOINT {}", savepoint))
            .await?;
        Ok(result)
    }

    /// Execute one statement in its own segment.
    pub(crate) async fn statement<C>(
        &self,
        conn: &C,
        sql: &str,
    ) -> Result<Result<u64, DbError>, DbError>
    where
        C: Connection + ?Sized,
    {
        let traced = conn.traced();
        match self.mode {
            SegmentMode::Atomic => self.guard(conn, traced.execute(sql)).await,
            SegmentMode::Startup => {
                traced.execute("BEGIN").await?;
                match traced.execute(sql).await {
                    Ok(affected) => Ok(traced.execute("COMMIT").await.map(|_| affected)),
                    Err(e) => {
                        if let Err(rollback) = traced.execute("ROLLBACK").await {
                            warn!(error = %rollback, "rollback failed");
                        }
                        Ok(Err(e))
                    }
                }
            }
        }
    }
}

/// A planned reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Changes organized by table.
    pub table_diffs: Vec<TableDiff>,
}

impl Plan {
    /// Returns true if the database already matches.
    pub fn is_empty(&self) -> bool {
        self.table_diffs.is_empty()
    }

    /// Count total number of changes.
    pub fn change_count(&self) -> usize {
        self.table_diffs.iter().map(|t| t.changes.len()).sum()
    }

    /// Generate SQL statements for all changes in this plan, in execution order.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut sql = String::new();
        for phase in Phase::ALL {
            for table_diff in &self.table_diffs {
                for change in table_diff.changes.iter().filter(|c| c.phase() == phase) {
                    if let Some(stmt) = change.to_sql(&table_diff.table, dialect) {
                        sql.push_str(&stmt);
                        sql.push_str(";\n");
                    }
                }
            }
        }
        sql
    }

    fn only(mut self, phase: Phase) -> Self {
        for diff in &mut self.table_diffs {
            diff.changes.retain(|c| c.phase() == phase);
        }
        self.table_diffs.retain(|d| !d.changes.is_empty());
        self
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            writeln!(f, "No changes detected.")?;
        } else {
            writeln!(f, "Changes detected:\n")?;
            for table_diff in &self.table_diffs {
                writeln!(f, "  {}:", table_diff.table)?;
                for change in &table_diff.changes {
                    writeln!(f, "    {}", change)?;
                }
            }
        }
        Ok(())
    }
}

/// Changes for a single table.
#[derive(Debug, Clone)]
pub struct TableDiff {
    pub table: String,
    pub changes: Vec<Change>,
}

/// A single additive schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a missing table. Carries the full column list, system columns included.
    CreateTable(TableDescriptor),
    /// Add a column missing from a live table.
    AddColumn(ColumnDescriptor),
    /// Create a missing index.
    CreateIndex {
        name: String,
        columns: Vec<String>,
        unique: bool,
    },
    /// Add a missing foreign-key constraint.
    AddForeignKey {
        name: String,
        column: String,
        fk: ForeignKeyDescriptor,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Structure,
    Index,
    ForeignKey,
}

impl Phase {
    const ALL: [Phase; 3] = [Phase::Structure, Phase::Index, Phase::ForeignKey];
}

impl Change {
    fn phase(&self) -> Phase {
        match self {
            Change::CreateTable(_) | Change::AddColumn(_) => Phase::Structure,
            Change::CreateIndex { .. } => Phase::Index,
            Change::AddForeignKey { .. } => Phase::ForeignKey,
        }
    }

    /// Generate the SQL statement for this change, if the dialect has one.
    pub fn to_sql(&self, table: &str, dialect: Dialect) -> Option<String> {
        match self {
            Change::CreateTable(t) => Some(create_table_sql(t, dialect)),
            Change::AddColumn(col) => Some(add_column_sql(table, col, dialect)),
            Change::CreateIndex {
                name,
                columns,
                unique,
            } => Some(create_index_sql(dialect, table, name, columns, *unique)),
            Change::AddForeignKey { name, column, fk } => {
                add_foreign_key_sql(dialect, table, name, column, fk)
            }
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::CreateTable(t) => write!(f, "+ table {}", t.name),
            Change::AddColumn(col) => {
                let nullable = if col.nullable { " (nullable)" } else { "" };
                write!(f, "+ {}: {}{}", col.name, col.data_type, nullable)
            }
            Change::CreateIndex {
                name,
                columns,
                unique,
            } => {
                let unique = if *unique { "UNIQUE " } else { "" };
                write!(f, "+ {}INDEX {} ({})", unique, name, columns.join(", "))
            }
            Change::AddForeignKey { column, fk, .. } => {
                write!(f, "+ FOREIGN KEY ({}) -> {}.{}", column, fk.table, fk.column)
            }
        }
    }
}

/// A statement that failed for a reason other than "already exists".
#[derive(Debug, Clone)]
pub struct Failure {
    pub table: String,
    pub sql: String,
    pub error: DbError,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.table, self.sql, self.error)
    }
}

/// What a reconciliation did.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Statements that succeeded.
    pub applied: Vec<String>,
    /// Statements that failed because their object already exists.
    pub tolerated: Vec<String>,
    pub failures: Vec<Failure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reconciles expanded tables against a live database.
pub struct Reconciler<'c, C: Connection + ?Sized> {
    conn: &'c C,
    dialect: Dialect,
    segments: Segments,
}

impl<'c, C: Connection + ?Sized> Reconciler<'c, C> {
    pub fn new(conn: &'c C) -> Self {
        Self::with_mode(conn, SegmentMode::Startup)
    }

    pub fn with_mode(conn: &'c C, mode: SegmentMode) -> Self {
        Self {
            conn,
            dialect: conn.dialect(),
            segments: Segments::new(mode),
        }
    }

    /// Plan and apply in one go.
    pub async fn reconcile(&self, tables: &[TableDescriptor]) -> Result<ReconcileReport, DbError> {
        let plan = self.plan(tables).await?;
        let report = self.apply(&plan).await?;
        info!(
            tables = tables.len(),
            planned = plan.change_count(),
            applied = report.applied.len(),
            tolerated = report.tolerated.len(),
            failed = report.failures.len(),
            "schema reconciled"
        );
        Ok(report)
    }

    /// Create only the missing indexes.
    pub async fn reconcile_indexes(
        &self,
        tables: &[TableDescriptor],
    ) -> Result<ReconcileReport, DbError> {
        let plan = self.plan(tables).await?.only(Phase::Index);
        self.apply(&plan).await
    }

    /// Create only the missing foreign-key constraints.
    pub async fn reconcile_foreign_keys(
        &self,
        tables: &[TableDescriptor],
    ) -> Result<ReconcileReport, DbError> {
        let plan = self.plan(tables).await?.only(Phase::ForeignKey);
        self.apply(&plan).await
    }

    /// Work out what each table is missing.
    pub async fn plan(&self, tables: &[TableDescriptor]) -> Result<Plan, DbError> {
        let targets: HashSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let mut live_tables = HashMap::new();
        let mut plan = Plan::default();

        for table in tables {
            let changes = self.plan_table(table, &targets, &mut live_tables).await?;
            if !changes.is_empty() {
                plan.table_diffs.push(TableDiff {
                    table: table.name.clone(),
                    changes,
                });
            }
        }

        Ok(plan)
    }

    async fn plan_table(
        &self,
        table: &TableDescriptor,
        targets: &HashSet<&str>,
        live_tables: &mut HashMap<String, bool>,
    ) -> Result<Vec<Change>, DbError> {
        let columns = effective_columns(table);
        let mut changes = Vec::new();

        let live = self.live_columns(&table.name).await?;
        let existing = match &live {
            Some(_) => self.existing_indexes(&table.name).await?,
            None => HashSet::new(),
        };
        live_tables.insert(table.name.clone(), live.is_some());

        match &live {
            None => {
                debug!(table = %table.name, "table missing");
                let mut create = table.clone();
                create.columns = columns.clone();
                changes.push(Change::CreateTable(create));
            }
            Some(live) => {
                for column in &columns {
                    if !live.contains(&column.name.to_ascii_lowercase()) {
                        changes.push(Change::AddColumn(column.clone()));
                    }
                }
            }
        }

        for (name, (index_columns, unique)) in desired_indexes(table, &columns) {
            if existing.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            changes.push(Change::CreateIndex {
                name,
                columns: index_columns,
                unique,
            });
        }

        if self.dialect.supports_foreign_keys() {
            for column in &columns {
                let Some(fk) = column.foreign_key.as_ref().filter(|_| column.is_local_foreign_key())
                else {
                    continue;
                };
                let name = foreign_key_name(&table.name, &column.name, &fk.table, &fk.column);
                if existing.contains(&name.to_ascii_lowercase()) {
                    continue;
                }
                if !targets.contains(fk.table.as_str())
                    && !self.table_is_live(&fk.table, live_tables).await?
                {
                    debug!(table = %table.name, column = %column.name, target = %fk.table, "foreign key target missing, skipping constraint");
                    continue;
                }
                changes.push(Change::AddForeignKey {
                    name,
                    column: column.name.clone(),
                    fk: fk.clone(),
                });
            }
        }

        Ok(changes)
    }

    /// Lowercased live column names, or `None` if the table does not exist.
    async fn live_columns(&self, table: &str) -> Result<Option<HashSet<String>>, DbError> {
        let sql = probe_table_sql(self.dialect, table);
        let traced = self.conn.traced();
        match self.segments.guard(self.conn, traced.columns(&sql)).await? {
            Ok(columns) => Ok(Some(
                columns.iter().map(|c| c.to_ascii_lowercase()).collect(),
            )),
            Err(e) => {
                debug!(table, error = %e, "probe failed, treating table as missing");
                Ok(None)
            }
        }
    }

    async fn table_is_live(
        &self,
        table: &str,
        cache: &mut HashMap<String, bool>,
    ) -> Result<bool, DbError> {
        if let Some(live) = cache.get(table) {
            return Ok(*live);
        }
        let live = self.live_columns(table).await?.is_some();
        cache.insert(table.to_string(), live);
        Ok(live)
    }

    /// Lowercased index and constraint names on `table`.
    ///
    /// Empty when the dialect has no catalog or the catalog query fails, in
    /// which case every index is attempted and conflicts are tolerated.
    async fn existing_indexes(&self, table: &str) -> Result<HashSet<String>, DbError> {
        let Some(sql) = index_catalog_sql(self.dialect, table) else {
            return Ok(HashSet::new());
        };
        let traced = self.conn.traced();
        match self.segments.guard(self.conn, traced.query(&sql)).await? {
            Ok(rows) => Ok(rows
                .iter()
                .filter_map(|row| row.first()?.as_str().map(|s| s.to_ascii_lowercase()))
                .collect()),
            Err(e) => {
                debug!(table, error = %e, "index catalog unavailable");
                Ok(HashSet::new())
            }
        }
    }

    /// Execute a plan, phase by phase.
    pub async fn apply(&self, plan: &Plan) -> Result<ReconcileReport, DbError> {
        let mut report = ReconcileReport::default();

        for phase in Phase::ALL {
            for diff in &plan.table_diffs {
                for change in diff.changes.iter().filter(|c| c.phase() == phase) {
                    let Some(sql) = change.to_sql(&diff.table, self.dialect) else {
                        continue;
                    };
                    match self.segments.statement(self.conn, &sql).await? {
                        Ok(_) => report.applied.push(sql),
                        Err(e) if e.is_already_exists() => {
                            debug!(table = %diff.table, sql = %sql, "already exists");
                            report.tolerated.push(sql);
                        }
                        Err(error) => {
                            warn!(table = %diff.table, sql = %sql, error = %error, "schema statement failed");
                            report.failures.push(Failure {
                                table: diff.table.clone(),
                                sql,
                                error,
                            });
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

/// Indexes a table should have, keyed by name: `(columns, unique)`.
pub(crate) fn desired_indexes(
    table: &TableDescriptor,
    columns: &[ColumnDescriptor],
) -> IndexMap<String, (Vec<String>, bool)> {
    let mut out = IndexMap::new();

    for column in columns {
        if column.primary_key || column.auto_increment {
            continue;
        }
        if column.unique {
            out.insert(
                unique_index_name(&table.name, &column.name),
                (vec![column.name.clone()], true),
            );
        } else if column.indexed {
            out.insert(
                index_name(&table.name, &column.name),
                (vec![column.name.clone()], false),
            );
        }
    }

    for group in &table.composite_keys {
        if group.is_empty() {
            continue;
        }
        out.insert(
            composite_unique_name(&table.name, group),
            (group.clone(), true),
        );
    }

    if table.is_join_table {
        let pair: Vec<String> = columns
            .iter()
            .filter(|c| c.is_local_foreign_key())
            .map(|c| c.name.clone())
            .collect();
        if pair.len() >= 2 {
            out.insert(composite_unique_name(&table.name, &pair), (pair, true));
        }
    }

    out
}
