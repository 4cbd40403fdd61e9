//! Columns every table carries, and the world table's own layout.

use cartograph_schema::{ColumnDescriptor, TableDescriptor};
use indexmap::IndexMap;

/// Names of the system columns, in the order they are created.
pub const SYSTEM_COLUMN_NAMES: &[&str] = &[
    "id",
    "version",
    "created_at",
    "updated_at",
    "deleted_at",
    "reference_id",
    "permission",
    "status",
];

/// The columns the engine adds to every reconciled table.
pub fn system_columns() -> Vec<ColumnDescriptor> {
    vec![
        ColumnDescriptor::new("id", "id", "INTEGER")
            .primary_key()
            .auto_increment(),
        ColumnDescriptor::new("version", "measurement", "INTEGER")
            .nullable()
            .default_value("1"),
        ColumnDescriptor::new("created_at", "datetime", "timestamp")
            .default_value("current_timestamp")
            .indexed(),
        ColumnDescriptor::new("updated_at", "datetime", "timestamp")
            .nullable()
            .indexed(),
        ColumnDescriptor::new("deleted_at", "datetime", "timestamp").nullable(),
        ColumnDescriptor::new("reference_id", "alias", "varchar(40)")
            .unique()
            .indexed(),
        ColumnDescriptor::new("permission", "value", "int(11)").nullable(),
        ColumnDescriptor::new("status", "label", "varchar(100)").nullable(),
    ]
}

pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMN_NAMES.contains(&name)
}

/// System columns followed by the table's own columns.
///
/// A declared column whose name collides with a system column is dropped;
/// declared duplicates and blank names are passed through for the DDL
/// synthesizer to collapse.
pub fn desired_columns(table: &TableDescriptor) -> Vec<ColumnDescriptor> {
    let mut columns = system_columns();
    columns.extend(
        table
            .columns
            .iter()
            .filter(|c| !is_system_column(c.name.trim()))
            .cloned(),
    );
    columns
}

/// Desired columns with duplicates and blank names removed, last definition wins.
pub fn effective_columns(table: &TableDescriptor) -> Vec<ColumnDescriptor> {
    let mut out: IndexMap<String, ColumnDescriptor> = IndexMap::new();
    for column in desired_columns(table) {
        let name = column.name.trim().to_string();
        if name.is_empty() {
            continue;
        }
        out.insert(name, column);
    }
    out.into_values().collect()
}

/// Layout of the world table, which the store creates directly.
pub fn world_table(name: &str) -> TableDescriptor {
    let mut table = TableDescriptor::new(name);
    table.columns = system_columns();
    table.columns.extend([
        ColumnDescriptor::new("table_name", "name", "varchar(200)"),
        ColumnDescriptor::new("world_schema_json", "json", "longtext"),
        ColumnDescriptor::new("default_permission", "value", "int(4)").default_value("644"),
        ColumnDescriptor::new("is_top_level", "truefalse", "boolean").default_value("true"),
        ColumnDescriptor::new("is_hidden", "truefalse", "boolean").default_value("false"),
        ColumnDescriptor::new("is_join_table", "truefalse", "boolean").default_value("false"),
        ColumnDescriptor::new("is_state_tracking_enabled", "truefalse", "boolean")
            .default_value("false"),
    ]);
    table.is_hidden = true;
    table
}

const RESERVED_WORDS: &[&str] = &[
    "add", "all", "alter", "and", "as", "asc", "between", "by", "case", "check", "column",
    "constraint", "create", "cross", "default", "delete", "desc", "distinct", "drop", "else",
    "end", "exists", "foreign", "from", "full", "grant", "group", "having", "in", "index",
    "inner", "insert", "into", "is", "join", "key", "left", "like", "limit", "not", "null",
    "offset", "on", "or", "order", "outer", "primary", "references", "right", "select", "set",
    "table", "then", "to", "union", "unique", "update", "using", "values", "when", "where",
];

/// Whether `word` is an SQL keyword that may not be used as a column name.
pub fn is_reserved_word(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    RESERVED_WORDS.contains(&lower.as_str())
}

