//! The engine: startup synchronization and the published schema snapshot.

use crate::config::EngineConfig;
use crate::error::{DeclarationError, Error};
use crate::expand::{ExpandOptions, Expansion, expand};
use crate::reconcile::{Plan, ReconcileReport, Reconciler};
use crate::standard::effective_columns;
use crate::traced::Connection;
use crate::world::{SyncReport, WorldRecord, WorldStore};
use cartograph_schema::{ColumnDescriptor, Permission, RelationDescriptor, TableDescriptor};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// The declared entities and relations an application starts with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Declarations {
    pub tables: Vec<TableDescriptor>,
    pub relations: Vec<RelationDescriptor>,
}

impl Declarations {
    pub fn new(tables: Vec<TableDescriptor>, relations: Vec<RelationDescriptor>) -> Self {
        Self { tables, relations }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Fold persisted records into the declarations.
    ///
    /// Declared flags and column definitions win. Columns and tables only
    /// present in the records are kept, and persisted relations follow the
    /// declared ones.
    pub fn merge_records(mut self, records: &[WorldRecord]) -> Self {
        for record in records {
            let persisted = &record.schema.table;
            match self.tables.iter_mut().find(|t| t.name == persisted.name) {
                Some(declared) => {
                    for column in &persisted.columns {
                        declared.push_missing(column.clone());
                    }
                    for group in &persisted.composite_keys {
                        if !declared.composite_keys.contains(group) {
                            declared.composite_keys.push(group.clone());
                        }
                    }
                    if declared.default_permission.is_none() {
                        declared.default_permission = persisted.default_permission;
                    }
                }
                None => self.tables.push(persisted.clone()),
            }
            self.relations
                .extend(record.schema.relations.iter().cloned());
        }
        self
    }
}

/// An immutable view of the recorded schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    tables: IndexMap<String, TableDescriptor>,
    relations: Vec<RelationDescriptor>,
    records: IndexMap<String, WorldRecord>,
}

impl SchemaSnapshot {
    pub fn from_records(records: Vec<WorldRecord>) -> Self {
        let mut tables = IndexMap::new();
        let mut relations = Vec::new();
        let mut seen = HashSet::new();
        let mut by_name = IndexMap::new();

        for record in records {
            tables.insert(record.table_name.clone(), record.schema.table.clone());
            for relation in &record.schema.relations {
                if seen.insert(relation.hash()) {
                    relations.push(relation.clone());
                }
            }
            by_name.insert(record.table_name.clone(), record);
        }

        Self {
            tables,
            relations,
            records: by_name,
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.get(name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.tables.values()
    }

    pub fn relations(&self) -> &[RelationDescriptor] {
        &self.relations
    }

    /// Relations where `table` is the subject or the object.
    pub fn relations_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a RelationDescriptor> {
        self.relations.iter().filter(move |r| r.mentions(table))
    }

    /// Names of tables with state tracking enabled.
    pub fn state_tables(&self) -> Vec<&str> {
        self.tables
            .values()
            .filter(|t| t.is_state_tracking_enabled)
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn world_record(&self, table: &str) -> Option<&WorldRecord> {
        self.records.get(table)
    }

    pub fn records(&self) -> impl Iterator<Item = &WorldRecord> {
        self.records.values()
    }

    /// Permission given to new rows of `table`.
    pub fn permission_of(&self, table: &str) -> Option<Permission> {
        self.records.get(table).map(|r| r.default_permission)
    }

    /// Every physical column of `table`, system columns first.
    pub fn columns_of(&self, table: &str) -> Option<Vec<ColumnDescriptor>> {
        self.tables.get(table).map(effective_columns)
    }

    /// The recorded schema as a declaration set, for re-expansion.
    pub fn declarations(&self) -> Declarations {
        Declarations::new(
            self.tables.values().cloned().collect(),
            self.relations.clone(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// What startup did.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// DDL run to create or extend the world table.
    pub bootstrap: Vec<String>,
    pub problems: Vec<DeclarationError>,
    pub reconcile: ReconcileReport,
    pub world: SyncReport,
}

impl StartupReport {
    /// Number of DDL statements that actually changed the database.
    pub fn ddl_count(&self) -> usize {
        self.bootstrap.len() + self.reconcile.applied.len()
    }
}

/// Owns a connection and the current schema snapshot.
pub struct Engine<C: Connection> {
    pub(crate) conn: C,
    pub(crate) config: EngineConfig,
    pub(crate) snapshot: RwLock<Arc<SchemaSnapshot>>,
    pub(crate) edit_lock: tokio::sync::Mutex<()>,
}

impl<C: Connection> Engine<C> {
    /// Bring the database in line with `declarations` and publish the result.
    pub async fn start(
        conn: C,
        config: EngineConfig,
        declarations: Declarations,
    ) -> Result<(Self, StartupReport), Error> {
        let report = {
            let store = WorldStore::new(&conn, &config.world_table);
            let bootstrap = store.bootstrap().await?;
            let records = store.load().await?;
            let merged = declarations.merge_records(&records);

            let user_count = store.count_rows(&config.user_table).await;
            let options =
                ExpandOptions::new(&config, config.bootstrap.system_has_no_admin(user_count));
            let expansion = expand(merged.tables, merged.relations, &options);

            let reconcile = Reconciler::new(&conn).reconcile(&expansion.tables).await?;
            let world = store
                .sync(
                    &expansion.tables,
                    &expansion.relations,
                    config.bootstrap.should_widen(user_count),
                )
                .await?;

            StartupReport {
                bootstrap,
                problems: expansion.problems,
                reconcile,
                world,
            }
        };

        info!(
            dialect = %conn.dialect(),
            tables = report.world.records.len(),
            ddl = report.ddl_count(),
            problems = report.problems.len(),
            failures = report.reconcile.failures.len(),
            "schema synchronized"
        );

        let snapshot = SchemaSnapshot::from_records(report.world.records.clone());
        let engine = Self {
            conn,
            config,
            snapshot: RwLock::new(Arc::new(snapshot)),
            edit_lock: tokio::sync::Mutex::new(()),
        };
        Ok((engine, report))
    }

    /// Expand and plan without touching the database.
    pub async fn plan(
        conn: &C,
        config: &EngineConfig,
        declarations: Declarations,
    ) -> Result<(Expansion, Plan), Error> {
        let store = WorldStore::new(conn, &config.world_table);
        let records = if store.exists().await {
            store.load().await?
        } else {
            Vec::new()
        };
        let merged = declarations.merge_records(&records);
        let user_count = store.count_rows(&config.user_table).await;
        let options = ExpandOptions::new(config, config.bootstrap.system_has_no_admin(user_count));
        let expansion = expand(merged.tables, merged.relations, &options);
        let plan = Reconciler::new(conn).plan(&expansion.tables).await?;
        Ok((expansion, plan))
    }

    /// The current snapshot. Never observes a half-applied edit.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> WorldStore<'_, C> {
        WorldStore::new(&self.conn, &self.config.world_table)
    }

    /// Re-read the world records and publish them.
    pub(crate) async fn reload(&self) -> Result<Arc<SchemaSnapshot>, Error> {
        let records = self.store().load().await?;
        let snapshot = Arc::new(SchemaSnapshot::from_records(records));
        *self.snapshot.write() = snapshot.clone();
        Ok(snapshot)
    }
}
