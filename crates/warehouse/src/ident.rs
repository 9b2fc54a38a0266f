//! Identifier quoting for generated SQL.
//!
//! Schema, table and principal names must be plain identifiers. Column names
//! come from the raw sources and are quoted; control characters are refused.

use materializer_core::error::QueryErrorCode;
use materializer_core::{is_identifier, Error, RelationRef, Result};

/// Refuses names that are not plain identifiers.
pub fn plain(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(Error::query(
            QueryErrorCode::InvalidIdentifier,
            format!("{:?} is not a plain identifier", name),
        ))
    }
}

fn check_column(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(char::is_control) || name.contains('?') {
        return Err(Error::query(
            QueryErrorCode::InvalidIdentifier,
            format!("column name {:?} cannot be quoted", name),
        ));
    }
    Ok(())
}

/// ClickHouse backtick quoting.
pub fn backtick(name: &str) -> Result<String> {
    check_column(name)?;
    Ok(format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`")))
}

/// ANSI double-quote quoting.
pub fn double_quote(name: &str) -> Result<String> {
    check_column(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `` `schema`.`name` `` for ClickHouse.
pub fn clickhouse_table(relation: &RelationRef) -> Result<String> {
    Ok(format!(
        "`{}`.`{}`",
        plain(&relation.schema)?,
        plain(&relation.name)?
    ))
}

/// `"schema"."name"` for PostgreSQL.
pub fn postgres_table(relation: &RelationRef) -> Result<String> {
    Ok(format!(
        "\"{}\".\"{}\"",
        plain(&relation.schema)?,
        plain(&relation.name)?
    ))
}
