//! DDL statement rendering.

use crate::{Dialect, Ident, Lit, boolean_default, is_timestamp_type, remap_type};
use cartograph_schema::{ColumnDescriptor, ForeignKeyDescriptor, TableDescriptor};
use indexmap::IndexMap;

/// Table options MySQL needs for full unicode text.
pub const MYSQL_TABLE_SUFFIX: &str = "CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci";

/// Render one column definition line.
///
/// Timestamps without a default are always nullable, whatever the
/// descriptor says: there is nothing sensible to put in existing rows.
pub fn column_line(column: &ColumnDescriptor, dialect: Dialect) -> String {
    let name = Ident(dialect, &column.name);
    let data_type = remap_type(dialect, &column.data_type);

    if column.auto_increment {
        return match dialect {
            Dialect::Postgres => format!("{} SERIAL PRIMARY KEY", name),
            Dialect::Mysql => format!("{} {} NOT NULL AUTO_INCREMENT PRIMARY KEY", name, data_type),
            Dialect::Sqlite => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", name),
        };
    }

    let mut def = format!("{} {}", name, data_type);

    let nullable =
        column.nullable || (is_timestamp_type(&data_type) && column.default_value.is_none());
    if nullable {
        def.push_str(" NULL");
    } else {
        def.push_str(" NOT NULL");
    }

    if column.primary_key {
        def.push_str(" PRIMARY KEY");
    }

    if let Some(default) = &column.default_value {
        def.push_str(&format!(
            " DEFAULT {}",
            boolean_default(dialect, &data_type, default)
        ));
    }

    def
}

/// Generate a CREATE TABLE statement.
///
/// Columns are deduplicated by name: a later definition replaces an earlier
/// one but keeps its position. Blank names are skipped. Indexes and foreign
/// keys are not included; they are created separately under deterministic
/// names.
pub fn create_table_sql(table: &TableDescriptor, dialect: Dialect) -> String {
    let mut columns: IndexMap<&str, &ColumnDescriptor> = IndexMap::new();
    for column in &table.columns {
        let name = column.name.trim();
        if name.is_empty() {
            continue;
        }
        columns.insert(name, column);
    }

    let parts: Vec<String> = columns
        .values()
        .map(|col| format!("    {}", column_line(col, dialect)))
        .collect();

    let mut sql = format!("CREATE TABLE {} (\n", Ident(dialect, &table.name));
    sql.push_str(&parts.join(",\n"));
    sql.push_str("\n)");

    if dialect == Dialect::Mysql {
        sql.push(' ');
        sql.push_str(MYSQL_TABLE_SUFFIX);
    }

    sql
}

/// Generate an ALTER TABLE ... ADD COLUMN statement.
///
/// SQLite cannot add a primary key, a NOT NULL column without a default, or
/// a column whose default is not constant; those parts are relaxed there.
pub fn add_column_sql(table: &str, column: &ColumnDescriptor, dialect: Dialect) -> String {
    let line = if dialect == Dialect::Sqlite {
        column_line(&sqlite_addable(column), dialect)
    } else {
        column_line(column, dialect)
    };
    format!("ALTER TABLE {} ADD COLUMN {}", Ident(dialect, table), line)
}

fn sqlite_addable(column: &ColumnDescriptor) -> ColumnDescriptor {
    let mut col = column.clone();
    col.primary_key = false;
    col.auto_increment = false;
    if col.default_value.as_deref().is_some_and(|d| !is_constant_default(d)) {
        col.default_value = None;
    }
    if col.default_value.is_none() {
        col.nullable = true;
    }
    col
}

fn is_constant_default(default: &str) -> bool {
    let lower = default.trim().to_ascii_lowercase();
    !(lower.starts_with("current_") || lower.contains('('))
}

/// Generate a CREATE [UNIQUE] INDEX statement.
pub fn create_index_sql(
    dialect: Dialect,
    table: &str,
    name: &str,
    columns: &[impl AsRef<str>],
    unique: bool,
) -> String {
    let unique = if unique { "UNIQUE " } else { "" };
    let quoted: Vec<String> = columns
        .iter()
        .map(|c| Ident(dialect, c.as_ref()).to_string())
        .collect();
    format!(
        "CREATE {}INDEX {} ON {} ({})",
        unique,
        Ident(dialect, name),
        Ident(dialect, table),
        quoted.join(", ")
    )
}

/// Generate a DROP INDEX statement.
pub fn drop_index_sql(dialect: Dialect, table: &str, name: &str) -> String {
    match dialect {
        Dialect::Mysql => format!(
            "DROP INDEX {} ON {}",
            Ident(dialect, name),
            Ident(dialect, table)
        ),
        Dialect::Postgres | Dialect::Sqlite => {
            format!("DROP INDEX IF EXISTS {}", Ident(dialect, name))
        }
    }
}

/// Generate the statement renaming an index in place.
///
/// Returns `None` for SQLite, where the index has to be dropped and created
/// again under the new name.
pub fn rename_index_sql(dialect: Dialect, table: &str, from: &str, to: &str) -> Option<String> {
    match dialect {
        Dialect::Postgres => Some(format!(
            "ALTER INDEX {} RENAME TO {}",
            Ident(dialect, from),
            Ident(dialect, to)
        )),
        Dialect::Mysql => Some(format!(
            "ALTER TABLE {} RENAME INDEX {} TO {}",
            Ident(dialect, table),
            Ident(dialect, from),
            Ident(dialect, to)
        )),
        Dialect::Sqlite => None,
    }
}

/// Generate the statement renaming a foreign-key constraint in place.
///
/// Only Postgres has one; MySQL constraints are dropped and added again.
pub fn rename_foreign_key_sql(dialect: Dialect, table: &str, from: &str, to: &str) -> Option<String> {
    match dialect {
        Dialect::Postgres => Some(format!(
            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
            Ident(dialect, table),
            Ident(dialect, from),
            Ident(dialect, to)
        )),
        Dialect::Mysql | Dialect::Sqlite => None,
    }
}

/// Generate an ALTER TABLE ... ADD CONSTRAINT ... FOREIGN KEY statement.
///
/// Returns `None` for dialects where foreign keys are not managed.
pub fn add_foreign_key_sql(
    dialect: Dialect,
    table: &str,
    name: &str,
    column: &str,
    fk: &ForeignKeyDescriptor,
) -> Option<String> {
    if !dialect.supports_foreign_keys() {
        return None;
    }
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
        Ident(dialect, table),
        Ident(dialect, name),
        Ident(dialect, column),
        Ident(dialect, &fk.table),
        Ident(dialect, &fk.column)
    ))
}

/// Generate the statement dropping a foreign-key constraint.
pub fn drop_foreign_key_sql(dialect: Dialect, table: &str, name: &str) -> Option<String> {
    match dialect {
        Dialect::Postgres => Some(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            Ident(dialect, table),
            Ident(dialect, name)
        )),
        Dialect::Mysql => Some(format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            Ident(dialect, table),
            Ident(dialect, name)
        )),
        Dialect::Sqlite => None,
    }
}

pub fn drop_table_sql(dialect: Dialect, table: &str) -> String {
    format!("DROP TABLE {}", Ident(dialect, table))
}

pub fn drop_column_sql(dialect: Dialect, table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        Ident(dialect, table),
        Ident(dialect, column)
    )
}

pub fn rename_column_sql(dialect: Dialect, table: &str, from: &str, to: &str) -> String {
    format!(
        "ALTER TABLE {} RENAME COLUMN {} TO {}",
        Ident(dialect, table),
        Ident(dialect, from),
        Ident(dialect, to)
    )
}

/// Cheap existence probe: fails if the table is missing, and its result
/// metadata lists the live columns even when the table is empty.
pub fn probe_table_sql(dialect: Dialect, table: &str) -> String {
    format!("SELECT * FROM {} LIMIT 1", Ident(dialect, table))
}

pub fn count_rows_sql(dialect: Dialect, table: &str) -> String {
    format!("SELECT COUNT(*) FROM {}", Ident(dialect, table))
}

/// Query listing the index and constraint names present on `table`.
///
/// Returns `None` for dialects without an accessible catalog.
pub fn index_catalog_sql(dialect: Dialect, table: &str) -> Option<String> {
    match dialect {
        Dialect::Postgres => Some(format!(
            "SELECT indexname FROM pg_indexes WHERE tablename = {t} \
             UNION SELECT c.conname FROM pg_constraint c \
             JOIN pg_class t ON c.conrelid = t.oid WHERE t.relname = {t}",
            t = Lit(dialect, table)
        )),
        Dialect::Mysql => Some(format!(
            "SELECT index_name FROM information_schema.statistics \
             WHERE table_schema = database() AND table_name = {t} \
             UNION SELECT constraint_name FROM information_schema.table_constraints \
             WHERE table_schema = database() AND table_name = {t}",
            t = Lit(dialect, table)
        )),
        Dialect::Sqlite => None,
    }
}
