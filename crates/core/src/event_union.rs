//! Normalized event stream built from the page and track sources.
//!
//! Both sources are reshaped to a common row, tagged with their origin and
//! concatenated without deduplication. Each row then gets the idle gap since
//! the previous row of the same visitor.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::relation::{datediff_minutes, datediff_seconds, Column, ColumnType, Relation, RelationRef, Value};
use crate::schema::{
    require_columns, ANONYMOUS_ID_COLUMN, ID_COLUMN, PAGE_LABEL_COLUMN, RECEIVED_AT_COLUMN,
    TRACK_LABEL_COLUMN,
};
use crate::selector::PropertySelector;

/// Names the union emits itself; never propagated as properties.
pub const RESERVED_COLUMNS: &[&str] = &[
    "id",
    "anonymous_id",
    "received_at",
    "event",
    "event_source",
    "idle_time_seconds",
    "idle_time_minutes",
];

/// Origin of a unioned event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Pages,
    Tracks,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pages => "pages",
            Self::Tracks => "tracks",
        }
    }

    /// Column holding this source's event label.
    pub fn label_column(&self) -> &'static str {
        match self {
            Self::Pages => PAGE_LABEL_COLUMN,
            Self::Tracks => TRACK_LABEL_COLUMN,
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the normalized stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EventUnionRow {
    pub id: Option<String>,
    pub anonymous_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub event: Option<String>,
    pub event_source: EventSource,
    /// Values aligned with [`EventUnion::property_columns`].
    pub properties: Vec<Value>,
    pub idle_time_seconds: Option<i64>,
    pub idle_time_minutes: Option<i64>,
}

/// The normalized stream, sorted by visitor then `received_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventUnion {
    pub property_columns: Vec<Column>,
    pub rows: Vec<EventUnionRow>,
}

/// A raw source relation paired with its origin tag.
#[derive(Debug, Clone, Copy)]
pub struct RawSource<'a> {
    pub relation_ref: &'a RelationRef,
    pub source: EventSource,
    pub data: &'a Relation,
}

/// Builds the unioned event stream from the page and track relations.
pub fn build(pages: RawSource<'_>, tracks: RawSource<'_>, patterns: &[String]) -> Result<EventUnion> {
    let selector = PropertySelector::new(patterns);
    let page_props = source_properties(&selector, pages.data);
    let track_props = source_properties(&selector, tracks.data);
    let property_columns = merge_property_columns(&page_props, &track_props);

    let mut rows = Vec::with_capacity(pages.data.len() + tracks.data.len());
    for raw in [pages, tracks] {
        normalize(raw, &property_columns, &mut rows)?;
    }

    rows.sort_by(compare_rows);
    assign_idle_gaps(&mut rows);

    debug!(
        rows = rows.len(),
        properties = property_columns.len(),
        "Built event union"
    );

    Ok(EventUnion {
        property_columns,
        rows,
    })
}

/// Whether a column name is emitted by the union itself.
pub fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.contains(&name)
}

fn source_properties(selector: &PropertySelector<'_>, data: &Relation) -> Vec<Column> {
    selector
        .select(&data.columns)
        .into_iter()
        .filter(|c| !is_reserved(&c.name))
        .collect()
}

/// Ordered union by name: page columns first, then track-only columns.
/// A name typed differently by the two sources widens to text.
fn merge_property_columns(pages: &[Column], tracks: &[Column]) -> Vec<Column> {
    let mut merged: Vec<Column> = pages.iter().map(|c| Column::new(&c.name, c.column_type)).collect();
    for col in tracks {
        match merged.iter_mut().find(|m| m.name == col.name) {
            Some(existing) if existing.column_type != col.column_type => {
                existing.column_type = ColumnType::Text;
            }
            Some(_) => {}
            None => merged.push(Column::new(&col.name, col.column_type)),
        }
    }
    merged
}

fn normalize(
    raw: RawSource<'_>,
    property_columns: &[Column],
    out: &mut Vec<EventUnionRow>,
) -> Result<()> {
    let data = raw.data;
    let idx = require_columns(
        raw.relation_ref,
        &data.columns,
        &[
            ID_COLUMN,
            ANONYMOUS_ID_COLUMN,
            RECEIVED_AT_COLUMN,
            raw.source.label_column(),
        ],
    )?;
    let (id_idx, anon_idx, received_idx, label_idx) = (idx[0], idx[1], idx[2], idx[3]);

    let prop_idx: Vec<Option<usize>> = property_columns
        .iter()
        .map(|c| data.column_index(&c.name))
        .collect();

    let mut dropped = 0usize;
    for row in &data.rows {
        let Some(received_at) = row[received_idx].as_timestamp() else {
            dropped += 1;
            continue;
        };

        let properties = property_columns
            .iter()
            .zip(&prop_idx)
            .map(|(col, idx)| match idx {
                Some(i) => row[*i].clone().coerce(col.column_type),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()?;

        out.push(EventUnionRow {
            id: row[id_idx].to_text(),
            anonymous_id: row[anon_idx].to_text(),
            received_at,
            event: row[label_idx].to_text(),
            event_source: raw.source,
            properties,
            idle_time_seconds: None,
            idle_time_minutes: None,
        });
    }

    if dropped > 0 {
        warn!(
            relation = %raw.relation_ref,
            dropped,
            "Dropped rows without a usable received_at"
        );
    }
    Ok(())
}

/// Visitor, then `received_at`, then `id`, then source.
fn compare_rows(a: &EventUnionRow, b: &EventUnionRow) -> Ordering {
    a.anonymous_id
        .cmp(&b.anonymous_id)
        .then(a.received_at.cmp(&b.received_at))
        .then_with(|| a.id.cmp(&b.id))
        .then(a.event_source.cmp(&b.event_source))
}

/// Fills the idle gap columns; rows must already be sorted by visitor.
fn assign_idle_gaps(rows: &mut [EventUnionRow]) {
    let mut previous: Option<(String, DateTime<Utc>)> = None;
    for row in rows.iter_mut() {
        // A row without a visitor has no predecessor and is nobody's predecessor.
        let Some(visitor) = row.anonymous_id.clone() else {
            previous = None;
            continue;
        };
        if let Some((prev_visitor, prev_at)) = &previous {
            if *prev_visitor == visitor {
                row.idle_time_seconds = Some(datediff_seconds(*prev_at, row.received_at));
                row.idle_time_minutes = Some(datediff_minutes(*prev_at, row.received_at));
            }
        }
        previous = Some((visitor, row.received_at));
    }
}

impl EventUnion {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.property_columns.iter().position(|c| c.name == name)
    }

    pub fn columns(&self) -> Vec<Column> {
        let mut columns = vec![
            Column::new("id", ColumnType::Text),
            Column::new("anonymous_id", ColumnType::Text),
            Column::required("received_at", ColumnType::Timestamp),
            Column::new("event", ColumnType::Text),
            Column::required("event_source", ColumnType::Text),
        ];
        columns.extend(self.property_columns.iter().cloned());
        columns.push(Column::new("idle_time_seconds", ColumnType::Integer));
        columns.push(Column::new("idle_time_minutes", ColumnType::Integer));
        columns
    }

    /// Flattens the stream for materialization.
    pub fn to_relation(&self) -> Relation {
        let rows = self
            .rows
            .iter()
            .map(|r| {
                let mut row = Vec::with_capacity(7 + r.properties.len());
                row.push(Value::from(r.id.clone()));
                row.push(Value::from(r.anonymous_id.clone()));
                row.push(Value::Timestamp(r.received_at));
                row.push(Value::from(r.event.clone()));
                row.push(Value::Text(r.event_source.as_str().to_string()));
                row.extend(r.properties.iter().cloned());
                row.push(Value::from(r.idle_time_seconds));
                row.push(Value::from(r.idle_time_minutes));
                row
            })
            .collect();
        Relation {
            columns: self.columns(),
            rows,
        }
    }
}
