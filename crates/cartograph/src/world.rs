//! The world table: one record per table, holding its schema blob.
//!
//! Records are the authoritative description of the schema between boots.
//! The world table itself is created directly, never through expansion or
//! reconciliation, so it exists before anything else is read.

use crate::db::SqlValue;
use crate::error::Error;
use crate::standard::world_table;
use crate::traced::{Connection, ConnectionExt};
use cartograph_schema::{Permission, RelationDescriptor, TableDescriptor, WorldSchema};
use cartograph_sql::{
    Dialect, Ident, Lit, add_column_sql, count_rows_sql, create_table_sql, probe_table_sql,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

const RECORD_COLUMNS: &str = "id, table_name, world_schema_json, permission, default_permission, \
     is_top_level, is_hidden, is_join_table, is_state_tracking_enabled";

/// One row of the world table.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldRecord {
    pub id: i64,
    pub table_name: String,
    pub schema: WorldSchema,
    /// Permission on the record itself.
    pub permission: Permission,
    /// Permission given to rows of the described table.
    pub default_permission: Permission,
    pub is_top_level: bool,
    pub is_hidden: bool,
    pub is_join_table: bool,
    pub is_state_tracking_enabled: bool,
}

impl WorldRecord {
    /// A record not yet stored, with flags taken from the table.
    ///
    /// `permission` also stands in for a default permission the table does
    /// not declare itself.
    pub fn new(schema: WorldSchema, permission: Permission) -> Self {
        let table = &schema.table;
        Self {
            id: 0,
            table_name: table.name.clone(),
            permission,
            default_permission: table.default_permission.unwrap_or(permission),
            is_top_level: table.is_top_level,
            is_hidden: table.is_hidden,
            is_join_table: table.is_join_table,
            is_state_tracking_enabled: table.is_state_tracking_enabled,
            schema,
        }
    }

    /// Replace the blob and refresh the flags from it.
    pub fn set_schema(&mut self, schema: WorldSchema) {
        let table = &schema.table;
        self.is_top_level = table.is_top_level;
        self.is_hidden = table.is_hidden;
        self.is_join_table = table.is_join_table;
        self.is_state_tracking_enabled = table.is_state_tracking_enabled;
        self.schema = schema;
    }

    /// Whether storing `schema` would change this record.
    pub fn differs_from(&self, schema: &WorldSchema) -> bool {
        let table = &schema.table;
        self.schema != *schema
            || self.is_top_level != table.is_top_level
            || self.is_hidden != table.is_hidden
            || self.is_join_table != table.is_join_table
            || self.is_state_tracking_enabled != table.is_state_tracking_enabled
    }
}

/// What a sync did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: usize,
    /// Tables whose blob could not be stored.
    pub failures: Vec<(String, Error)>,
    /// Every record after the sync.
    pub records: Vec<WorldRecord>,
}

/// Build the blob stored for `table`: the table plus the relations it is the subject of.
pub fn world_schema(table: &TableDescriptor, relations: &[RelationDescriptor]) -> WorldSchema {
    WorldSchema {
        table: table.clone(),
        relations: relations
            .iter()
            .filter(|r| r.subject == table.name)
            .cloned()
            .collect(),
    }
}

/// Reads and writes world records.
pub struct WorldStore<'c, C: Connection + ?Sized> {
    conn: &'c C,
    dialect: Dialect,
    table: String,
}

impl<'c, C: Connection + ?Sized> WorldStore<'c, C> {
    pub fn new(conn: &'c C, table: impl Into<String>) -> Self {
        Self {
            conn,
            dialect: conn.dialect(),
            table: table.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Make sure the world table exists with every column it needs.
    ///
    /// Returns the DDL that was executed.
    pub async fn bootstrap(&self) -> Result<Vec<String>, Error> {
        let layout = world_table(&self.table);
        let traced = self.conn.traced();
        let mut ddl = Vec::new();

        match traced.columns(&probe_table_sql(self.dialect, &self.table)).await {
            Err(_) => {
                let sql = create_table_sql(&layout, self.dialect);
                traced
                    .execute(&sql)
                    .await
                    .map_err(|e| Error::Bootstrap(format!("{}: {}", self.table, e)))?;
                info!(table = %self.table, "created world table");
                ddl.push(sql);
            }
            Ok(live) => {
                let live: HashSet<String> = live.iter().map(|c| c.to_ascii_lowercase()).collect();
                for column in &layout.columns {
                    if live.contains(&column.name.to_ascii_lowercase()) {
                        continue;
                    }
                    let sql = add_column_sql(&self.table, column, self.dialect);
                    traced
                        .execute(&sql)
                        .await
                        .map_err(|e| Error::Bootstrap(format!("{}: {}", self.table, e)))?;
                    ddl.push(sql);
                }
            }
        }

        Ok(ddl)
    }

    /// Whether the world table exists.
    pub async fn exists(&self) -> bool {
        self.conn
            .traced()
            .columns(&probe_table_sql(self.dialect, &self.table))
            .await
            .is_ok()
    }

    /// All live records, oldest first. Records whose blob does not decode are skipped.
    pub async fn load(&self) -> Result<Vec<WorldRecord>, Error> {
        self.select("deleted_at IS NULL").await
    }

    pub async fn get(&self, table_name: &str) -> Result<Option<WorldRecord>, Error> {
        let clause = format!(
            "deleted_at IS NULL AND table_name = {}",
            Lit(self.dialect, table_name)
        );
        Ok(self.select(&clause).await?.into_iter().next())
    }

    async fn select(&self, clause: &str) -> Result<Vec<WorldRecord>, Error> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY id",
            RECORD_COLUMNS,
            Ident(self.dialect, &self.table),
            clause
        );
        let rows = self.conn.traced().query(&sql).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_record(row) {
                Ok(record) => records.push(record),
                Err(reason) => warn!(table = %self.table, %reason, "skipping undecodable world record"),
            }
        }
        Ok(records)
    }

    pub async fn insert(&self, record: &WorldRecord) -> Result<(), Error> {
        let json = encode(record)?;
        let d = self.dialect;
        let sql = format!(
            "INSERT INTO {} (table_name, world_schema_json, reference_id, permission, \
             default_permission, is_top_level, is_hidden, is_join_table, is_state_tracking_enabled) \
             VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {})",
            Ident(d, &self.table),
            Lit(d, &record.table_name),
            Lit(d, &json),
            Lit(d, &Uuid::new_v4().to_string()),
            record.permission.bits(),
            record.default_permission.bits(),
            d.bool_lit(record.is_top_level),
            d.bool_lit(record.is_hidden),
            d.bool_lit(record.is_join_table),
            d.bool_lit(record.is_state_tracking_enabled),
        );
        self.conn.traced().execute(&sql).await?;
        Ok(())
    }

    /// Store the blob and flags of an existing record. Identity and permissions are left alone.
    pub async fn update(&self, record: &WorldRecord) -> Result<u64, Error> {
        let json = encode(record)?;
        let d = self.dialect;
        let sql = format!(
            "UPDATE {} SET world_schema_json = {}, is_top_level = {}, is_hidden = {}, \
             is_join_table = {}, is_state_tracking_enabled = {}, updated_at = CURRENT_TIMESTAMP \
             WHERE table_name = {}",
            Ident(d, &self.table),
            Lit(d, &json),
            d.bool_lit(record.is_top_level),
            d.bool_lit(record.is_hidden),
            d.bool_lit(record.is_join_table),
            d.bool_lit(record.is_state_tracking_enabled),
            Lit(d, &record.table_name),
        );
        Ok(self.conn.traced().execute(&sql).await?)
    }

    pub async fn delete(&self, table_name: &str) -> Result<u64, Error> {
        let sql = format!(
            "DELETE FROM {} WHERE table_name = {}",
            Ident(self.dialect, &self.table),
            Lit(self.dialect, table_name)
        );
        Ok(self.conn.traced().execute(&sql).await?)
    }

    /// Number of rows in `table`, or 0 if it does not exist.
    pub async fn count_rows(&self, table: &str) -> u64 {
        match self
            .conn
            .traced()
            .query(&count_rows_sql(self.dialect, table))
            .await
        {
            Ok(rows) => rows
                .first()
                .and_then(|row| row.first())
                .and_then(SqlValue::as_i64)
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or(0),
            Err(e) => {
                debug!(table, error = %e, "count failed, assuming empty");
                0
            }
        }
    }

    /// Record every table, inserting new records and refreshing changed ones.
    ///
    /// `widen` opens up the permission of records inserted by this call. A
    /// default permission the table declares is kept either way.
    pub async fn sync(
        &self,
        tables: &[TableDescriptor],
        relations: &[RelationDescriptor],
        widen: bool,
    ) -> Result<SyncReport, Error> {
        let existing: HashMap<String, WorldRecord> = self
            .load()
            .await?
            .into_iter()
            .map(|r| (r.table_name.clone(), r))
            .collect();
        let mut report = SyncReport::default();

        for table in tables {
            let schema = world_schema(table, relations);
            let result = match existing.get(&table.name) {
                None => {
                    let permission = if widen {
                        warn!(table = %table.name, "no administrator yet, recording table with open permission");
                        Permission::ALLOW_ALL
                    } else {
                        Permission::DEFAULT
                    };
                    let result = self.insert(&WorldRecord::new(schema, permission)).await;
                    if result.is_ok() {
                        report.inserted.push(table.name.clone());
                    }
                    result
                }
                Some(record) if record.differs_from(&schema) => {
                    let mut record = record.clone();
                    record.set_schema(schema);
                    let result = self.update(&record).await.map(|_| ());
                    if result.is_ok() {
                        report.updated.push(table.name.clone());
                    }
                    result
                }
                Some(_) => {
                    report.unchanged += 1;
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(e @ Error::Serialization { .. }) => {
                    warn!(table = %table.name, error = %e, "world record not stored");
                    report.failures.push((table.name.clone(), e));
                }
                Err(e) => return Err(e),
            }
        }

        report.records = self.load().await?;
        info!(
            inserted = report.inserted.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged,
            failed = report.failures.len(),
            "world records synced"
        );
        Ok(report)
    }
}

fn encode(record: &WorldRecord) -> Result<String, Error> {
    serde_json::to_string(&record.schema).map_err(|source| Error::Serialization {
        table: record.table_name.clone(),
        source,
    })
}

fn permission(value: &SqlValue, fallback: Permission) -> Permission {
    value
        .as_i64()
        .and_then(|v| u64::try_from(v).ok())
        .map(Permission)
        .unwrap_or(fallback)
}

fn decode_record(row: &[SqlValue]) -> Result<WorldRecord, String> {
    let [
        id,
        table_name,
        blob,
        record_permission,
        default_permission,
        top_level,
        hidden,
        join_table,
        state_tracking,
    ] = row
    else {
        return Err(format!("expected 9 columns, got {}", row.len()));
    };

    let table_name = table_name
        .as_str()
        .ok_or_else(|| "table_name is not text".to_string())?;
    let json = blob
        .as_str()
        .ok_or_else(|| format!("{}: world_schema_json is not text", table_name))?;
    let schema: WorldSchema =
        serde_json::from_str(json).map_err(|e| format!("{}: {}", table_name, e))?;

    Ok(WorldRecord {
        id: id.as_i64().unwrap_or_default(),
        table_name: table_name.to_string(),
        schema,
        permission: permission(record_permission, Permission::NONE),
        default_permission: permission(default_permission, Permission::DEFAULT),
        is_top_level: top_level.as_bool().unwrap_or(true),
        is_hidden: hidden.as_bool().unwrap_or(false),
        is_join_table: join_table.as_bool().unwrap_or(false),
        is_state_tracking_enabled: state_tracking.as_bool().unwrap_or(false),
    })
}

#[cfg(test)]
mod tests;
