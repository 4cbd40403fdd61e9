//! Runtime schema edits.
//!
//! Each edit holds the engine's edit lock and runs inside one database
//! transaction. The snapshot is republished only after a commit; on any
//! error the transaction is rolled back and readers keep the old snapshot.

use crate::engine::{Declarations, Engine, SchemaSnapshot};
use crate::error::{DeclarationError, EditError};
use crate::expand::{ExpandOptions, expand};
use crate::reconcile::{ReconcileReport, Reconciler, SegmentMode, Segments, desired_indexes};
use crate::standard::{effective_columns, is_reserved_word, is_system_column};
use crate::traced::{Connection, ConnectionExt};
use cartograph_schema::{ColumnDescriptor, RelationDescriptor, TableDescriptor, WorldSchema};
use cartograph_sql::{
    Dialect, add_foreign_key_sql, composite_unique_name, create_index_sql, drop_column_sql,
    drop_foreign_key_sql, drop_index_sql, drop_table_sql, foreign_key_name, index_catalog_sql,
    index_name, rename_column_sql, rename_foreign_key_sql, rename_index_sql, unique_index_name,
};
use indexmap::IndexMap;
use tracing::{info, warn};

impl<C: Connection> Engine<C> {
    /// Rename a column. Spaces in `new` become underscores.
    ///
    /// Indexes and foreign-key constraints on the column move to the names
    /// derived from the new column name, and the copies of the column kept
    /// by the audit and translation companions are renamed along with it.
    pub async fn rename_column(&self, table: &str, old: &str, new: &str) -> Result<(), EditError> {
        let _guard = self.edit_lock.lock().await;

        let new = new.trim().replace(' ', "_");
        if old == new {
            return Ok(());
        }
        if is_reserved_word(&new) {
            return Err(EditError::ReservedWord(new));
        }
        if is_system_column(old) {
            return Err(EditError::SystemColumn(old.to_string()));
        }

        let snapshot = self.snapshot();
        let record = snapshot
            .world_record(table)
            .ok_or_else(|| EditError::NoSuchTable(table.to_string()))?;
        let mut schema = record.schema.clone();
        if !schema.table.has_column(old) {
            return Err(EditError::NoSuchColumn {
                table: table.to_string(),
                column: old.to_string(),
            });
        }
        if schema.table.has_column(&new) || is_system_column(&new) {
            return Err(EditError::ColumnExists {
                table: table.to_string(),
                column: new,
            });
        }

        let before = schema.table.clone();
        rename_in_schema(&mut schema, old, &new);
        let companions: Vec<WorldSchema> = ["_audit", "_i18n"]
            .iter()
            .filter_map(|suffix| snapshot.world_record(&format!("{}{}", table, suffix)))
            .filter(|r| r.schema.table.has_column(old) && !r.schema.table.has_column(&new))
            .map(|r| {
                let mut companion = r.schema.clone();
                rename_in_schema(&mut companion, old, &new);
                companion
            })
            .collect();
        let dialect = self.conn.dialect();

        self.begin().await?;
        let result: Result<(), EditError> = async {
            let traced = self.conn.traced();
            traced
                .execute(&rename_column_sql(dialect, table, old, &new))
                .await?;
            self.rename_derived_names(&before, &schema.table, old, &new)
                .await?;
            self.store_schema(&snapshot, schema).await?;
            for companion in companions {
                traced
                    .execute(&rename_column_sql(dialect, &companion.table.name, old, &new))
                    .await?;
                self.store_schema(&snapshot, companion).await?;
            }
            Ok(())
        }
        .await;
        self.finish(result).await?;

        info!(table, old, new = %new, "column renamed");
        self.reload().await?;
        Ok(())
    }

    /// Drop a column and forget it.
    pub async fn delete_column(&self, table: &str, column: &str) -> Result<(), EditError> {
        let _guard = self.edit_lock.lock().await;

        if is_system_column(column) {
            return Err(EditError::SystemColumn(column.to_string()));
        }
        let snapshot = self.snapshot();
        let record = snapshot
            .world_record(table)
            .ok_or_else(|| EditError::NoSuchTable(table.to_string()))?;
        let mut schema = record.schema.clone();
        let Some(descriptor) = schema.table.column(column).cloned() else {
            return Err(EditError::NoSuchColumn {
                table: table.to_string(),
                column: column.to_string(),
            });
        };

        self.begin().await?;
        let result: Result<(), EditError> = async {
            for sql in self.column_drop_ddl(&schema.table, &descriptor).await? {
                self.conn.traced().execute(&sql).await?;
            }
            forget_column(&mut schema, column);
            self.store_schema(&snapshot, schema).await
        }
        .await;
        self.finish(result).await?;

        info!(table, column, "column deleted");
        self.reload().await?;
        Ok(())
    }

    /// Drop a table along with everything derived from it.
    ///
    /// Foreign-key columns pointing at it are removed from other tables,
    /// join tables of its many-valued relations are dropped, as are its
    /// state, audit and translation companions. Every error is collected;
    /// if there are any, nothing is changed.
    pub async fn delete_table(&self, table: &str) -> Vec<EditError> {
        let _guard = self.edit_lock.lock().await;

        let snapshot = self.snapshot();
        if snapshot.world_record(table).is_none() {
            return vec![EditError::NoSuchTable(table.to_string())];
        }

        let doomed = doomed_tables(&snapshot, table);
        let dialect = self.conn.dialect();
        let segments = Segments::new(SegmentMode::Atomic);
        let mut errors = Vec::new();
        let mut rewritten: IndexMap<String, WorldSchema> = IndexMap::new();

        if let Err(e) = self.begin().await {
            return vec![e];
        }

        // Foreign-key columns other tables hold through owned relations.
        for relation in snapshot.relations() {
            if relation.object != table
                || !relation.kind.is_owned()
                || doomed.contains(&relation.subject)
            {
                continue;
            }
            let Some(subject) = snapshot.table(&relation.subject) else {
                continue;
            };
            let Some(column) = subject.column(&relation.object_name).cloned() else {
                continue;
            };
            let ddl = match self.column_drop_ddl(subject, &column).await {
                Ok(ddl) => ddl,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for sql in ddl {
                if let Err(e) = self.run_segment(&segments, &sql).await {
                    errors.push(e);
                }
            }
            let schema = sibling_schema(&mut rewritten, &snapshot, &relation.subject);
            if let Some(schema) = schema {
                forget_column(schema, &relation.object_name);
            }
        }

        // Explicit foreign keys declared on columns of surviving tables.
        for other in snapshot.tables() {
            if doomed.contains(&other.name) {
                continue;
            }
            for column in &other.columns {
                let Some(fk) = column.foreign_key.as_ref().filter(|fk| fk.table == table) else {
                    continue;
                };
                let owned = snapshot.relations().iter().any(|r| {
                    r.kind.is_owned()
                        && r.subject == other.name
                        && r.object == table
                        && r.object_name == column.name
                });
                if owned {
                    continue;
                }
                let name = foreign_key_name(&other.name, &column.name, &fk.table, &fk.column);
                match self.has_catalog_entry(&segments, &other.name, &name).await {
                    Ok(true) => {
                        if let Some(sql) = drop_foreign_key_sql(dialect, &other.name, &name)
                            && let Err(e) = self.run_segment(&segments, &sql).await
                        {
                            errors.push(e);
                        }
                    }
                    Ok(false) => {}
                    Err(e) => errors.push(e),
                }
                if let Some(schema) = sibling_schema(&mut rewritten, &snapshot, &other.name)
                    && let Some(col) = schema.table.column_mut(&column.name)
                {
                    col.foreign_key = None;
                }
            }
        }

        // Relations mentioning the table disappear from every surviving blob.
        for record in snapshot.records() {
            if doomed.contains(&record.table_name)
                || !record.schema.relations.iter().any(|r| r.mentions(table))
            {
                continue;
            }
            if let Some(schema) = sibling_schema(&mut rewritten, &snapshot, &record.table_name) {
                schema.relations.retain(|r| !r.mentions(table));
            }
        }

        for name in &doomed {
            if let Err(e) = self.run_segment(&segments, &drop_table_sql(dialect, name)).await {
                errors.push(e);
            }
            if let Err(e) = self.store().delete(name).await {
                errors.push(e.into());
            }
        }

        for (name, schema) in rewritten {
            if let Err(e) = self.store_schema(&snapshot, schema).await {
                warn!(table = %name, error = %e, "sibling record not rewritten");
                errors.push(e);
            }
        }

        let outcome = if errors.is_empty() { Ok(()) } else { Err(()) };
        let traced = self.conn.traced();
        match outcome {
            Ok(()) => {
                if let Err(e) = traced.execute("COMMIT").await {
                    errors.push(e.into());
                }
            }
            Err(()) => {
                warn!(table, errors = errors.len(), "table deletion rolled back");
                if let Err(e) = traced.execute("ROLLBACK").await {
                    errors.push(e.into());
                }
            }
        }
        if !errors.is_empty() {
            return errors;
        }

        info!(table, dropped = doomed.len(), "table deleted");
        if let Err(e) = self.reload().await {
            errors.push(e.into());
        }
        errors
    }

    /// Declare a new table, with relations, and create it.
    pub async fn add_table(
        &self,
        table: TableDescriptor,
        relations: Vec<RelationDescriptor>,
    ) -> Result<ReconcileReport, EditError> {
        let _guard = self.edit_lock.lock().await;

        let snapshot = self.snapshot();
        if snapshot.table(&table.name).is_some() {
            return Err(EditError::TableExists(table.name));
        }
        check_new_columns(&table.name, &table.columns)?;

        let mut declarations = snapshot.declarations();
        declarations.tables.push(table);
        declarations.relations.extend(relations);
        self.apply_declarations(&snapshot, declarations).await
    }

    /// Declare a new column on an existing table and add it.
    pub async fn add_column(
        &self,
        table: &str,
        column: ColumnDescriptor,
    ) -> Result<ReconcileReport, EditError> {
        let _guard = self.edit_lock.lock().await;

        let snapshot = self.snapshot();
        if snapshot.table(table).is_none() {
            return Err(EditError::NoSuchTable(table.to_string()));
        }
        check_new_columns(table, std::slice::from_ref(&column))?;
        if snapshot.table(table).is_some_and(|t| t.has_column(&column.name)) {
            return Err(EditError::ColumnExists {
                table: table.to_string(),
                column: column.name,
            });
        }

        let mut declarations = snapshot.declarations();
        if let Some(target) = declarations.tables.iter_mut().find(|t| t.name == table) {
            target.columns.push(column);
        }
        self.apply_declarations(&snapshot, declarations).await
    }

    /// Expand, reconcile and record `declarations` in one transaction.
    async fn apply_declarations(
        &self,
        snapshot: &SchemaSnapshot,
        declarations: Declarations,
    ) -> Result<ReconcileReport, EditError> {
        let store = self.store();
        let user_count = store.count_rows(&self.config.user_table).await;
        let options = ExpandOptions::new(
            &self.config,
            self.config.bootstrap.system_has_no_admin(user_count),
        );

        let baseline = snapshot.declarations();
        let known = expand(baseline.tables, baseline.relations, &options).problems;
        let expansion = expand(declarations.tables, declarations.relations, &options);
        if let Some(problem) = expansion.problems.iter().find(|p| !known.contains(p)) {
            return Err(EditError::Declaration(problem.clone()));
        }

        self.begin().await?;
        let result: Result<ReconcileReport, EditError> = async {
            let report = Reconciler::with_mode(&self.conn, SegmentMode::Atomic)
                .reconcile(&expansion.tables)
                .await?;
            if let Some(failure) = report.failures.first() {
                return Err(EditError::Ddl(failure.clone()));
            }
            let mut synced = store
                .sync(
                    &expansion.tables,
                    &expansion.relations,
                    self.config.bootstrap.should_widen(user_count),
                )
                .await?;
            if !synced.failures.is_empty() {
                let (_, error) = synced.failures.remove(0);
                return Err(error.into());
            }
            Ok(report)
        }
        .await;
        let report = self.finish(result).await?;

        info!(applied = report.applied.len(), "schema extended");
        self.reload().await?;
        Ok(report)
    }

    async fn begin(&self) -> Result<(), EditError> {
        self.conn.traced().execute("BEGIN").await?;
        Ok(())
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(&self, result: Result<T, EditError>) -> Result<T, EditError> {
        let traced = self.conn.traced();
        match result {
            Ok(value) => {
                traced.execute("COMMIT").await?;
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "schema edit rolled back");
                if let Err(rollback) = traced.execute("ROLLBACK").await {
                    warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn run_segment(&self, segments: &Segments, sql: &str) -> Result<(), EditError> {
        segments.statement(&self.conn, sql).await??;
        Ok(())
    }

    /// Store an updated blob for an existing record.
    async fn store_schema(
        &self,
        snapshot: &SchemaSnapshot,
        schema: WorldSchema,
    ) -> Result<(), EditError> {
        let Some(record) = snapshot.world_record(&schema.table.name) else {
            return Err(EditError::NoSuchTable(schema.table.name));
        };
        let mut record = record.clone();
        record.set_schema(schema);
        self.store().update(&record).await?;
        Ok(())
    }

    /// Move the indexes and the foreign key of a renamed column to the names
    /// the new column name derives.
    async fn rename_derived_names(
        &self,
        before: &TableDescriptor,
        after: &TableDescriptor,
        old: &str,
        new: &str,
    ) -> Result<(), EditError> {
        let dialect = self.conn.dialect();
        let traced = self.conn.traced();
        let segments = Segments::new(SegmentMode::Atomic);
        let table = after.name.as_str();

        let old_indexes = desired_indexes(before, &effective_columns(before));
        let new_indexes = desired_indexes(after, &effective_columns(after));
        for ((from, _), (to, (columns, unique))) in old_indexes.iter().zip(&new_indexes) {
            if from == to {
                continue;
            }
            match rename_index_sql(dialect, table, from, to) {
                Some(sql) => {
                    if self.has_catalog_entry(&segments, table, from).await? {
                        traced.execute(&sql).await?;
                    }
                }
                None => {
                    traced.execute(&drop_index_sql(dialect, table, from)).await?;
                    traced
                        .execute(&create_index_sql(dialect, table, to, columns, *unique))
                        .await?;
                }
            }
        }

        let Some(column) = after.column(new).filter(|c| c.is_local_foreign_key()) else {
            return Ok(());
        };
        let Some(fk) = column.foreign_key.as_ref() else {
            return Ok(());
        };
        let from = foreign_key_name(table, old, &fk.table, &fk.column);
        let to = foreign_key_name(table, new, &fk.table, &fk.column);
        if !dialect.supports_foreign_keys()
            || !self.has_catalog_entry(&segments, table, &from).await?
        {
            return Ok(());
        }
        match rename_foreign_key_sql(dialect, table, &from, &to) {
            Some(sql) => {
                traced.execute(&sql).await?;
            }
            None => {
                if let Some(sql) = drop_foreign_key_sql(dialect, table, &from) {
                    traced.execute(&sql).await?;
                }
                if let Some(sql) = add_foreign_key_sql(dialect, table, &to, new, fk) {
                    traced.execute(&sql).await?;
                }
            }
        }
        Ok(())
    }

    /// Whether `name` is a live index or constraint on `table`.
    async fn has_catalog_entry(
        &self,
        segments: &Segments,
        table: &str,
        name: &str,
    ) -> Result<bool, EditError> {
        let Some(sql) = index_catalog_sql(self.conn.dialect(), table) else {
            return Ok(false);
        };
        let traced = self.conn.traced();
        let rows = segments.guard(&self.conn, traced.query(&sql)).await??;
        Ok(rows.iter().any(|row| {
            row.first()
                .and_then(|v| v.as_str())
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        }))
    }

    /// Statements that remove `column` from `table`.
    ///
    /// SQLite refuses to drop an indexed column, so its indexes go first.
    /// MySQL refuses to drop a column under a foreign-key constraint.
    async fn column_drop_ddl(
        &self,
        table: &TableDescriptor,
        column: &ColumnDescriptor,
    ) -> Result<Vec<String>, EditError> {
        let dialect = self.conn.dialect();
        let mut ddl = Vec::new();

        match dialect {
            Dialect::Sqlite => {
                ddl.push(drop_index_sql(
                    dialect,
                    &table.name,
                    &unique_index_name(&table.name, &column.name),
                ));
                ddl.push(drop_index_sql(
                    dialect,
                    &table.name,
                    &index_name(&table.name, &column.name),
                ));
                for group in &table.composite_keys {
                    if group.contains(&column.name) {
                        ddl.push(drop_index_sql(
                            dialect,
                            &table.name,
                            &composite_unique_name(&table.name, group),
                        ));
                    }
                }
            }
            Dialect::Mysql => {
                if let Some(fk) = column.foreign_key.as_ref() {
                    let name = foreign_key_name(&table.name, &column.name, &fk.table, &fk.column);
                    let segments = Segments::new(SegmentMode::Atomic);
                    if self.has_catalog_entry(&segments, &table.name, &name).await?
                        && let Some(sql) = drop_foreign_key_sql(dialect, &table.name, &name)
                    {
                        ddl.push(sql);
                    }
                }
            }
            Dialect::Postgres => {}
        }

        ddl.push(drop_column_sql(dialect, &table.name, &column.name));
        Ok(ddl)
    }
}

/// Reject column names that can never be added.
fn check_new_columns(table: &str, columns: &[ColumnDescriptor]) -> Result<(), EditError> {
    if table.chars().count() < 2 {
        return Err(EditError::Declaration(DeclarationError::InvalidTableName(
            table.to_string(),
        )));
    }
    for column in columns {
        if is_reserved_word(&column.name) {
            return Err(EditError::ReservedWord(column.name.clone()));
        }
        if is_system_column(&column.name) {
            return Err(EditError::SystemColumn(column.name.clone()));
        }
    }
    Ok(())
}

fn rename_in_schema(schema: &mut WorldSchema, old: &str, new: &str) {
    if let Some(column) = schema.table.column_mut(old) {
        column.name = new.to_string();
    }
    for group in &mut schema.table.composite_keys {
        for name in group.iter_mut().filter(|n| *n == old) {
            *name = new.to_string();
        }
    }
    for relation in &mut schema.relations {
        if relation.kind.is_owned() && relation.object_name == old {
            relation.object_name = new.to_string();
        }
    }
}

/// Remove a column from a blob, with any owned relation it materialized.
fn forget_column(schema: &mut WorldSchema, column: &str) {
    schema.table.remove_column(column);
    schema
        .relations
        .retain(|r| !(r.kind.is_owned() && r.object_name == column));
}

/// The working copy of a surviving table's blob.
fn sibling_schema<'a>(
    rewritten: &'a mut IndexMap<String, WorldSchema>,
    snapshot: &SchemaSnapshot,
    table: &str,
) -> Option<&'a mut WorldSchema> {
    if !rewritten.contains_key(table) {
        let record = snapshot.world_record(table)?;
        rewritten.insert(table.to_string(), record.schema.clone());
    }
    rewritten.get_mut(table)
}

/// Tables dropped along with `table`, in drop order: join-table state
/// companions, join tables, the table's own companions, the table.
fn doomed_tables(snapshot: &SchemaSnapshot, table: &str) -> Vec<String> {
    let mut doomed: Vec<String> = Vec::new();
    let mut push = |name: String| {
        if snapshot.world_record(&name).is_some() && !doomed.contains(&name) {
            doomed.push(name);
        }
    };

    for relation in snapshot.relations_of(table) {
        if let Some(join) = relation.join_table_name() {
            push(format!("{}_state", join));
            push(join);
        }
    }
    for suffix in ["_state", "_audit", "_i18n"] {
        push(format!("{}{}", table, suffix));
    }
    push(table.to_string());
    doomed
}
