//! Schema descriptors for cartograph.
//!
//! These types describe what the database *should* look like: tables,
//! their columns, and the relations between tables. They are plain data,
//! serializable to JSON so they can be persisted in the world table and
//! read back on the next boot.
//!
//! System columns (`id`, `reference_id`, timestamps...) are never stored in
//! a [`TableDescriptor`]; the engine adds them when it reconciles a table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

mod permission;
pub use permission::Permission;

/// SQL type used for injected foreign-key columns.
pub const FOREIGN_KEY_DATA_TYPE: &str = "int(11)";

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnDescriptor {
    /// Column name
    pub name: String,
    /// Semantic type ("label", "alias", "json", "encrypted", ...)
    pub column_type: String,
    /// Concrete SQL type, in the vocabulary of the declaration (e.g. `int(11)`)
    pub data_type: String,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Whether the column gets a unique index
    pub unique: bool,
    /// Whether the column gets a plain index
    pub indexed: bool,
    /// Whether this is the primary key
    pub primary_key: bool,
    /// Whether the database assigns values (serial / auto_increment)
    pub auto_increment: bool,
    /// Default value, as a raw SQL expression or quoted string
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Target of this column, if it is a foreign key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<ForeignKeyDescriptor>,
}

impl ColumnDescriptor {
    /// Create a non-null column with the given semantic and SQL types.
    pub fn new(
        name: impl Into<String>,
        column_type: impl Into<String>,
        data_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
            data_type: data_type.into(),
            ..Self::default()
        }
    }

    /// A foreign-key column pointing at `table.id` in this database.
    pub fn foreign(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(name, "alias", FOREIGN_KEY_DATA_TYPE).references(ForeignKeyDescriptor::new(
            table,
            "id",
            DataSource::SelfDb,
        ))
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn references(mut self, fk: ForeignKeyDescriptor) -> Self {
        self.foreign_key = Some(fk);
        self
    }

    /// Returns true if this column is a foreign key into this database.
    pub fn is_local_foreign_key(&self) -> bool {
        self.foreign_key
            .as_ref()
            .is_some_and(|fk| fk.data_source == DataSource::SelfDb)
    }
}

/// Where a foreign key's target lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataSource {
    /// A table in the connected database.
    #[default]
    SelfDb,
    /// A virtual or external reference, such as a cloud store.
    External(String),
}

impl From<String> for DataSource {
    fn from(s: String) -> Self {
        if s.is_empty() || s == "self" {
            DataSource::SelfDb
        } else {
            DataSource::External(s)
        }
    }
}

impl From<DataSource> for String {
    fn from(source: DataSource) -> Self {
        match source {
            DataSource::SelfDb => "self".to_string(),
            DataSource::External(name) => name,
        }
    }
}

/// A foreign-key target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeignKeyDescriptor {
    /// Referenced table
    pub table: String,
    /// Referenced column
    pub column: String,
    /// Where the referenced table lives
    pub data_source: DataSource,
}

impl ForeignKeyDescriptor {
    pub fn new(table: impl Into<String>, column: impl Into<String>, data_source: DataSource) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            data_source,
        }
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDescriptor {
    /// Table name, also the SQL identifier
    pub name: String,
    /// Declared and injected columns, in order
    pub columns: Vec<ColumnDescriptor>,
    pub is_top_level: bool,
    pub is_hidden: bool,
    pub is_join_table: bool,
    pub is_state_tracking_enabled: bool,
    pub is_audit_enabled: bool,
    pub translations_enabled: bool,
    /// Groups of column names that must be unique together
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub composite_keys: Vec<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_permission: Option<Permission>,
}

impl Default for TableDescriptor {
    fn default() -> Self {
        Self {
            name: String::new(),
            columns: Vec::new(),
            is_top_level: true,
            is_hidden: false,
            is_join_table: false,
            is_state_tracking_enabled: false,
            is_audit_enabled: false,
            translations_enabled: false,
            composite_keys: Vec::new(),
            default_permission: None,
        }
    }
}

impl TableDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder-style column append.
    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDescriptor> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Append `column` unless a column of that name exists. Returns true if appended.
    pub fn push_missing(&mut self, column: ColumnDescriptor) -> bool {
        if self.has_column(&column.name) {
            return false;
        }
        self.columns.push(column);
        true
    }

    /// Remove a column by name, along with any composite key group using it.
    pub fn remove_column(&mut self, name: &str) -> Option<ColumnDescriptor> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.composite_keys
            .retain(|group| !group.iter().any(|c| c == name));
        Some(self.columns.remove(idx))
    }
}

/// How a relation is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Subject holds a foreign key to the object.
    BelongsTo,
    /// Subject holds a foreign key to the object; at most one per subject.
    HasOne,
    /// A join table links subjects to objects.
    HasMany,
    /// A join table named after both roles, allowing self-reference.
    HasManyAndBelongsToMany,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::BelongsTo => "belongs_to",
            RelationKind::HasOne => "has_one",
            RelationKind::HasMany => "has_many",
            RelationKind::HasManyAndBelongsToMany => "has_many_and_belongs_to_many",
        }
    }

    /// Whether this relation is stored as a column on the subject table.
    pub fn is_owned(&self) -> bool {
        matches!(self, RelationKind::BelongsTo | RelationKind::HasOne)
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a relation kind string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRelationKind(pub String);

impl fmt::Display for UnknownRelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown relation kind: {}", self.0)
    }
}

impl std::error::Error for UnknownRelationKind {}

impl FromStr for RelationKind {
    type Err = UnknownRelationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "belongs_to" => Ok(RelationKind::BelongsTo),
            "has_one" => Ok(RelationKind::HasOne),
            "has_many" => Ok(RelationKind::HasMany),
            "has_many_and_belongs_to_many" => Ok(RelationKind::HasManyAndBelongsToMany),
            other => Err(UnknownRelationKind(other.to_string())),
        }
    }
}

/// A relation between two tables.
///
/// Identity is [`RelationDescriptor::hash`], which ignores extra columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDescriptor {
    pub subject: String,
    #[serde(default)]
    pub subject_name: String,
    pub object: String,
    #[serde(default)]
    pub object_name: String,
    #[serde(rename = "relation")]
    pub kind: RelationKind,
    /// Extra columns added to the subject (owned kinds) or the join table.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnDescriptor>,
}

impl RelationDescriptor {
    /// Create a relation with default role names (`{table}_id`).
    pub fn new(subject: impl Into<String>, kind: RelationKind, object: impl Into<String>) -> Self {
        let subject = subject.into();
        let object = object.into();
        Self {
            subject_name: format!("{}_id", subject),
            object_name: format!("{}_id", object),
            subject,
            object,
            kind,
            columns: Vec::new(),
        }
    }

    pub fn with_names(mut self, subject_name: impl Into<String>, object_name: impl Into<String>) -> Self {
        self.subject_name = subject_name.into();
        self.object_name = object_name.into();
        self
    }

    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.columns.push(column);
        self
    }

    /// Fill in role names left empty by a declaration.
    pub fn normalized(mut self) -> Self {
        if self.subject_name.is_empty() {
            self.subject_name = format!("{}_id", self.subject);
        }
        if self.object_name.is_empty() {
            self.object_name = format!("{}_id", self.object);
        }
        self
    }

    /// Stable identity of this relation.
    pub fn hash(&self) -> String {
        let canonical = format!(
            "[{}][{}][{}][{}][{}]",
            self.subject_name, self.kind, self.object_name, self.subject, self.object
        );
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }

    /// Returns true if `table` is the subject or the object.
    pub fn mentions(&self, table: &str) -> bool {
        self.subject == table || self.object == table
    }

    /// Name of the join table for many-valued kinds.
    pub fn join_table_name(&self) -> Option<String> {
        match self.kind {
            RelationKind::HasMany => Some(format!(
                "{}_{}_has_{}_{}",
                self.subject, self.subject_name, self.object, self.object_name
            )),
            RelationKind::HasManyAndBelongsToMany => {
                Some(format!("{}_{}", self.subject_name, self.object_name))
            }
            RelationKind::BelongsTo | RelationKind::HasOne => None,
        }
    }
}

impl fmt::Display for RelationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} {} ({})",
            self.subject, self.subject_name, self.kind, self.object, self.object_name
        )
    }
}

/// The blob persisted in the world table for one table.
///
/// Holds the relations where this table is the subject, so every relation
/// is stored exactly once across all records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSchema {
    pub table: TableDescriptor,
    #[serde(default)]
    pub relations: Vec<RelationDescriptor>,
}
