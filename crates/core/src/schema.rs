//! Shape validation for the raw event relations.

use crate::error::{Error, Result, SchemaErrorCode};
use crate::relation::{Column, ColumnType, RelationRef};

/// Raw page views relation name.
pub const PAGES_RELATION: &str = "pages";
/// Raw tracked actions relation name.
pub const TRACKS_RELATION: &str = "tracks";

/// Output relation names, in build order.
pub const EVENT_UNION_RELATION: &str = "event_union";
pub const SESSIONS_RELATION: &str = "sessions";
pub const EVENT_FACTS_RELATION: &str = "event_facts";

/// Columns every raw source must expose.
pub const ID_COLUMN: &str = "id";
pub const ANONYMOUS_ID_COLUMN: &str = "anonymous_id";
pub const RECEIVED_AT_COLUMN: &str = "received_at";

/// Label column of the page source.
pub const PAGE_LABEL_COLUMN: &str = "path";
/// Label column of the track source.
pub const TRACK_LABEL_COLUMN: &str = "event";

/// Validates that `columns` contain the algorithm's required inputs.
///
/// Returns the index of each required column, in the order given.
pub fn require_columns(
    relation: &RelationRef,
    columns: &[Column],
    required: &[&str],
) -> Result<Vec<usize>> {
    required
        .iter()
        .map(|name| {
            columns
                .iter()
                .position(|c| c.name == *name)
                .ok_or_else(|| Error::missing_column(relation, name))
        })
        .collect()
}

/// Validates a raw event source: `id`, `anonymous_id`, `received_at` and its label.
///
/// `received_at` must be a timestamp (or text holding one).
pub fn validate_source(relation: &RelationRef, columns: &[Column], label: &str) -> Result<()> {
    let idx = require_columns(
        relation,
        columns,
        &[ID_COLUMN, ANONYMOUS_ID_COLUMN, RECEIVED_AT_COLUMN, label],
    )?;

    let received_at = &columns[idx[2]];
    match received_at.column_type {
        ColumnType::Timestamp | ColumnType::Text => Ok(()),
        other => Err(Error::schema(
            SchemaErrorCode::InvalidType,
            format!(
                "{}.{} must be a timestamp, found {:?}",
                relation, RECEIVED_AT_COLUMN, other
            ),
        )),
    }
}
