//! Relation expansion.
//!
//! Takes the declared tables and relations and materializes every relation
//! into concrete structure:
//!
//! - `belongs_to` / `has_one` inject a foreign-key column into the subject.
//! - `has_many` creates a join table named
//!   `{subject}_{subject_name}_has_{object}_{object_name}`, plus a `_state`
//!   companion when a state-machine descriptor table exists and the object
//!   is not the group table.
//! - `has_many_and_belongs_to_many` creates a join table named
//!   `{subject_name}_{object_name}`, so a table can reference itself
//!   through two roles.
//!
//! Tables flagged for state tracking get a `{table}_state` companion, and
//! audit / translation flags produce `_audit` / `_i18n` copies of the table.
//! A translation row belongs to its source row through
//! `translation_reference_id`.
//!
//! Expansion is pure and idempotent: feeding its output back in yields the
//! same output. Relations are keyed by [`RelationDescriptor::hash`], so a
//! relation declared twice (or persisted and re-declared) exists once.

use crate::config::EngineConfig;
use crate::error::DeclarationError;
use crate::standard::is_system_column;
use cartograph_schema::{
    ColumnDescriptor, DataSource, Permission, RelationDescriptor, RelationKind, TableDescriptor,
};
use cartograph_sql::is_timestamp_type;
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Names and facts expansion depends on.
#[derive(Debug, Clone)]
pub struct ExpandOptions {
    pub user_table: String,
    pub group_table: String,
    pub state_machine_table: String,
    pub world_table: String,
    pub implicit_ownership: bool,
    /// Whether the user table has fewer rows than the bootstrap threshold.
    pub system_has_no_admin: bool,
}

impl ExpandOptions {
    pub fn new(config: &EngineConfig, system_has_no_admin: bool) -> Self {
        Self {
            user_table: config.user_table.clone(),
            group_table: config.group_table.clone(),
            state_machine_table: config.state_machine_table.clone(),
            world_table: config.world_table.clone(),
            implicit_ownership: config.implicit_ownership,
            system_has_no_admin,
        }
    }
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self::new(&EngineConfig::default(), false)
    }
}

/// Result of expanding a declaration set.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Declared tables first, in order, then derived tables as they were created.
    pub tables: Vec<TableDescriptor>,
    /// Canonical relations, one per hash.
    pub relations: Vec<RelationDescriptor>,
    /// Everything that was skipped, and why.
    pub problems: Vec<DeclarationError>,
}

impl Expansion {
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Relations persisted with `table`: those where it is the subject.
    pub fn owned_relations(&self, table: &str) -> Vec<RelationDescriptor> {
        self.relations
            .iter()
            .filter(|r| r.subject == table)
            .cloned()
            .collect()
    }
}

/// Expand declared tables and relations into a complete table list.
pub fn expand(
    tables: Vec<TableDescriptor>,
    relations: Vec<RelationDescriptor>,
    options: &ExpandOptions,
) -> Expansion {
    let mut expander = Expander {
        options,
        tables: IndexMap::new(),
        relations: IndexMap::new(),
        rejected: HashSet::new(),
        problems: Vec::new(),
    };

    for table in tables {
        expander.add_table(table);
    }
    for relation in relations {
        expander.add_relation(relation.normalized());
    }
    if options.implicit_ownership {
        expander.add_ownership();
    }
    expander.track_states();
    expander.materialize();
    expander.add_companions();
    expander.check_foreign_keys();
    expander.finish()
}

struct Expander<'o> {
    options: &'o ExpandOptions,
    tables: IndexMap<String, TableDescriptor>,
    relations: IndexMap<String, RelationDescriptor>,
    rejected: HashSet<String>,
    problems: Vec<DeclarationError>,
}

impl Expander<'_> {
    fn add_table(&mut self, table: TableDescriptor) {
        if table.name.chars().count() < 2 || table.name == self.options.world_table {
            warn!(table = %table.name, "skipping table with invalid name");
            self.problems
                .push(DeclarationError::InvalidTableName(table.name));
            return;
        }
        match self.tables.get_mut(&table.name) {
            Some(existing) => merge_table(existing, table),
            None => {
                self.tables.insert(table.name.clone(), table);
            }
        }
    }

    fn add_relation(&mut self, relation: RelationDescriptor) -> bool {
        let hash = relation.hash();
        if self.relations.contains_key(&hash) {
            return false;
        }
        self.relations.insert(hash, relation);
        true
    }

    fn add_ownership(&mut self) {
        let options = self.options;
        let has_user = self.tables.contains_key(&options.user_table);
        let has_group = self.tables.contains_key(&options.group_table);

        let owned: Vec<String> = self
            .tables
            .values()
            .filter(|t| !t.is_join_table && !t.is_hidden)
            .map(|t| t.name.clone())
            .collect();

        for name in owned {
            if has_user && name != options.user_table {
                self.add_relation(RelationDescriptor::new(
                    &name,
                    RelationKind::BelongsTo,
                    &options.user_table,
                ));
            }
            if has_group && name != options.group_table {
                self.add_relation(RelationDescriptor::new(
                    &name,
                    RelationKind::HasMany,
                    &options.group_table,
                ));
            }
        }
    }

    fn track_states(&mut self) {
        let owners: Vec<String> = self
            .tables
            .values()
            .filter(|t| t.is_state_tracking_enabled)
            .map(|t| t.name.clone())
            .collect();
        for owner in owners {
            self.enable_state_tracking(&owner);
        }
    }

    fn enable_state_tracking(&mut self, owner: &str) {
        let options = self.options;
        let state_name = format!("{}_state", owner);

        let state = self
            .tables
            .entry(state_name.clone())
            .or_insert_with(|| {
                debug!(table = %state_name, owner, "creating state table");
                derived_table(&state_name)
            });
        state.push_missing(ColumnDescriptor::new("current_state", "label", "varchar(100)"));

        if let Some(owner_table) = self.tables.get_mut(owner) {
            owner_table.is_state_tracking_enabled = true;
        }

        self.add_relation(
            RelationDescriptor::new(&state_name, RelationKind::BelongsTo, owner)
                .with_names(format!("{}_has_state", owner), format!("is_state_of_{}", owner)),
        );
        self.add_relation(
            RelationDescriptor::new(
                &state_name,
                RelationKind::HasOne,
                &options.state_machine_table,
            )
            .with_names(format!("{}_status", owner), format!("{}_smd", owner)),
        );
    }

    /// Walk the relation list, including relations appended while walking.
    fn materialize(&mut self) {
        let mut idx = 0;
        while let Some((hash, relation)) = self
            .relations
            .get_index(idx)
            .map(|(h, r)| (h.clone(), r.clone()))
        {
            idx += 1;

            let missing = [&relation.subject, &relation.object]
                .into_iter()
                .find(|t| !self.tables.contains_key(t.as_str()));
            if let Some(missing) = missing {
                warn!(relation = %relation, table = %missing, "relation references missing table");
                self.problems
                    .push(DeclarationError::missing_table(&relation, missing));
                self.rejected.insert(hash);
                continue;
            }

            if relation.subject == relation.object
                && relation.subject_name == relation.object_name
                && relation.join_table_name().is_some()
            {
                warn!(relation = %relation, "self-referencing relation needs two role names");
                self.problems.push(DeclarationError::AmbiguousSelfReference {
                    relation: relation.to_string(),
                });
                self.rejected.insert(hash);
                continue;
            }

            match relation.kind {
                RelationKind::BelongsTo => self.materialize_belongs_to(&relation),
                RelationKind::HasOne => self.materialize_has_one(&relation),
                RelationKind::HasMany => self.materialize_has_many(&relation),
                RelationKind::HasManyAndBelongsToMany => self.materialize_habtm(&relation),
            }
        }
    }

    fn materialize_belongs_to(&mut self, relation: &RelationDescriptor) {
        let options = self.options;
        let to_user = relation.object == options.user_table;
        self.inject_foreign_key(relation, !(to_user && options.system_has_no_admin));

        if !to_user && let Some(subject) = self.tables.get_mut(&relation.subject) {
            subject.is_top_level = false;
        }
    }

    fn materialize_has_one(&mut self, relation: &RelationDescriptor) {
        self.inject_foreign_key(relation, true);
    }

    fn materialize_has_many(&mut self, relation: &RelationDescriptor) {
        let Some(join) = relation.join_table_name() else {
            return;
        };
        self.ensure_join_table(&join, relation);

        let options = self.options;
        if relation.object != options.group_table
            && self.tables.contains_key(&options.state_machine_table)
        {
            self.enable_state_tracking(&join);
        }
    }

    fn materialize_habtm(&mut self, relation: &RelationDescriptor) {
        let Some(join) = relation.join_table_name() else {
            return;
        };
        self.ensure_join_table(&join, relation);
    }

    fn inject_foreign_key(&mut self, relation: &RelationDescriptor, nullable: bool) {
        let Some(subject) = self.tables.get_mut(&relation.subject) else {
            return;
        };
        if !subject.has_column(&relation.object_name) {
            let mut column = ColumnDescriptor::foreign(&relation.object_name, &relation.object);
            column.nullable = nullable;
            subject.columns.push(column);
        }
        for extra in &relation.columns {
            subject.push_missing(extra.clone());
        }
    }

    fn ensure_join_table(&mut self, name: &str, relation: &RelationDescriptor) {
        let join = self.tables.entry(name.to_string()).or_insert_with(|| {
            debug!(table = name, relation = %relation, "creating join table");
            let mut table = derived_table(name);
            table.is_join_table = true;
            table
        });
        join.push_missing(ColumnDescriptor::foreign(
            &relation.subject_name,
            &relation.subject,
        ));
        join.push_missing(ColumnDescriptor::foreign(
            &relation.object_name,
            &relation.object,
        ));
        for extra in &relation.columns {
            join.push_missing(extra.clone());
        }
    }

    fn add_companions(&mut self) {
        let mut sources = Vec::new();
        for table in self.tables.values() {
            if table.is_audit_enabled {
                sources.push((table.name.clone(), Companion::Audit));
            }
            if table.translations_enabled {
                sources.push((table.name.clone(), Companion::Translation));
            }
        }
        for (source, kind) in sources {
            self.ensure_companion(&source, kind);
        }
    }

    /// Create or grow `{source}{suffix}`. Existing columns are never touched.
    fn ensure_companion(&mut self, source: &str, kind: Companion) {
        let Some(source_table) = self.tables.get(source) else {
            return;
        };
        let copies: Vec<ColumnDescriptor> = source_table
            .columns
            .iter()
            .filter_map(|c| kind.copy_column(c))
            .collect();

        let name = format!("{}{}", source, kind.suffix());
        let companion = self.tables.entry(name.clone()).or_insert_with(|| {
            let mut table = derived_table(&name);
            table.default_permission = Some(Permission::COMPANION);
            table
        });

        let mut added = 0;
        for column in copies {
            if companion.push_missing(column) {
                added += 1;
            }
        }
        companion.push_missing(kind.discriminator());

        if added > 0 {
            debug!(table = %name, added, "companion table columns");
        }

        if kind == Companion::Translation {
            let relation = RelationDescriptor::new(&name, RelationKind::BelongsTo, source)
                .with_names(format!("{}_id", name), "translation_reference_id");
            self.add_relation(relation.clone());
            self.inject_foreign_key(&relation, true);
        }
    }

    fn check_foreign_keys(&mut self) {
        for table in self.tables.values() {
            for column in &table.columns {
                let Some(fk) = &column.foreign_key else {
                    continue;
                };
                if fk.data_source == DataSource::SelfDb && !self.tables.contains_key(&fk.table) {
                    warn!(table = %table.name, column = %column.name, target = %fk.table, "foreign key to missing table");
                    self.problems.push(DeclarationError::DanglingForeignKey {
                        table: table.name.clone(),
                        column: column.name.clone(),
                        target: fk.table.clone(),
                    });
                }
            }
        }
    }

    fn finish(self) -> Expansion {
        let Expander {
            tables,
            relations,
            rejected,
            problems,
            ..
        } = self;
        Expansion {
            tables: tables.into_values().collect(),
            relations: relations
                .into_iter()
                .filter(|(hash, _)| !rejected.contains(hash))
                .map(|(_, relation)| relation)
                .collect(),
            problems,
        }
    }
}

/// A hidden, non-top-level table created by expansion.
fn derived_table(name: &str) -> TableDescriptor {
    let mut table = TableDescriptor::new(name);
    table.is_top_level = false;
    table.is_hidden = true;
    table
}

/// Merge a repeated declaration into the first one.
fn merge_table(existing: &mut TableDescriptor, other: TableDescriptor) {
    for column in other.columns {
        existing.push_missing(column);
    }
    existing.is_top_level &= other.is_top_level;
    existing.is_hidden |= other.is_hidden;
    existing.is_join_table |= other.is_join_table;
    existing.is_state_tracking_enabled |= other.is_state_tracking_enabled;
    existing.is_audit_enabled |= other.is_audit_enabled;
    existing.translations_enabled |= other.translations_enabled;
    for group in other.composite_keys {
        if !existing.composite_keys.contains(&group) {
            existing.composite_keys.push(group);
        }
    }
    if existing.default_permission.is_none() {
        existing.default_permission = other.default_permission;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Companion {
    Audit,
    Translation,
}

impl Companion {
    fn suffix(self) -> &'static str {
        match self {
            Companion::Audit => "_audit",
            Companion::Translation => "_i18n",
        }
    }

    fn discriminator(self) -> ColumnDescriptor {
        match self {
            Companion::Audit => ColumnDescriptor::new("source_reference_id", "label", "varchar(40)"),
            Companion::Translation => ColumnDescriptor::new("language_id", "label", "varchar(10)"),
        }
    }

    /// The companion's version of a source column, if it gets one.
    ///
    /// Copies never carry identity, uniqueness, indexes or referential
    /// integrity; foreign keys become plain value columns.
    fn copy_column(self, column: &ColumnDescriptor) -> Option<ColumnDescriptor> {
        if column.primary_key || column.auto_increment || is_system_column(&column.name) {
            return None;
        }
        let mut copy = column.clone();
        copy.unique = false;
        copy.indexed = false;
        if copy.foreign_key.take().is_some() {
            copy.column_type = "value".to_string();
        }
        match self {
            Companion::Audit => {
                if is_timestamp_type(&copy.data_type) || copy.column_type == "datetime" {
                    copy.nullable = true;
                }
            }
            Companion::Translation => copy.nullable = true,
        }
        Some(copy)
    }
}
