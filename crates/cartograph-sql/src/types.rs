use crate::Dialect;
use std::borrow::Cow;

/// Type used when a column declares none.
pub const DEFAULT_DATA_TYPE: &str = "varchar(100)";

/// Map a declared SQL type to the target dialect's vocabulary.
///
/// Declarations are written in a MySQL-flavoured vocabulary (`int(11)`,
/// `longtext`, `datetime`...). MySQL and SQLite accept it as-is; Postgres
/// needs a few rewrites. The input is never modified.
pub fn remap_type(dialect: Dialect, data_type: &str) -> Cow<'_, str> {
    let trimmed = data_type.trim();
    if trimmed.is_empty() {
        return Cow::Borrowed(DEFAULT_DATA_TYPE);
    }
    if dialect != Dialect::Postgres {
        return Cow::Borrowed(trimmed);
    }

    let lower = trimmed.to_ascii_lowercase();

    if let Some(mapped) = postgres_integer(&lower) {
        return Cow::Borrowed(mapped);
    }

    let base = lower
        .strip_prefix("medium")
        .or_else(|| lower.strip_prefix("long"))
        .unwrap_or(&lower);

    let mapped = if let Some(rest) = base.strip_prefix("varbinary") {
        format!("bit{}", rest)
    } else if base.starts_with("blob") || base.starts_with("tinyblob") {
        "bytea".to_string()
    } else if let Some(rest) = base.strip_prefix("datetime") {
        format!("timestamp{}", rest)
    } else if base == "double" {
        "double precision".to_string()
    } else if base != lower {
        base.to_string()
    } else {
        return Cow::Borrowed(trimmed);
    };
    Cow::Owned(mapped)
}

/// Integer types with a display width, which Postgres rejects.
///
/// `tinyint(1)` stays an integer: declarations give it `0`/`1` defaults.
fn postgres_integer(lower: &str) -> Option<&'static str> {
    let (name, width) = lower.split_once('(')?;
    if !width.ends_with(')') {
        return None;
    }
    match name.trim() {
        "int" | "integer" | "mediumint" => Some("INTEGER"),
        "bigint" => Some("BIGINT"),
        "smallint" | "tinyint" => Some("SMALLINT"),
        _ => None,
    }
}

/// Rewrite a `0`/`1` default on a Postgres `boolean` column to a boolean literal.
pub fn boolean_default<'a>(dialect: Dialect, data_type: &str, default: &'a str) -> &'a str {
    if dialect != Dialect::Postgres || !data_type.trim().eq_ignore_ascii_case("boolean") {
        return default;
    }
    match default.trim().trim_matches('\'') {
        "0" => "false",
        "1" => "true",
        _ => default,
    }
}

/// Whether a (remapped) type is a timestamp-like type.
pub fn is_timestamp_type(data_type: &str) -> bool {
    let lower = data_type.trim().to_ascii_lowercase();
    lower.starts_with("timestamp") || lower.starts_with("datetime")
}
