//! Visitor sessions derived from the event union.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::event_union::{EventUnion, EventUnionRow};
use crate::relation::{Column, ColumnType, Relation, Value};
use crate::selector::PropertySelector;

/// Session timeout duration (30 minutes of inactivity).
pub const SESSION_TIMEOUT_MINUTES: i64 = 30;

/// Columns the sessions table emits itself; never propagated as properties.
pub const SESSION_BASE_COLUMNS: &[&str] = &[
    "session_id",
    "anonymous_id",
    "session_start_at",
    "session_sequence_number",
    "next_session_start_at",
];

/// A visitor session: the interval `[session_start_at, next_session_start_at)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub anonymous_id: String,
    pub session_start_at: DateTime<Utc>,
    pub session_sequence_number: i64,
    pub next_session_start_at: Option<DateTime<Utc>>,
    /// Values aligned with [`Sessions::property_columns`], taken from the starting row.
    pub properties: Vec<Value>,
}

impl Session {
    /// Whether `at` falls inside this session's interval.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.session_start_at <= at && self.next_session_start_at.map_or(true, |next| at < next)
    }
}

/// All sessions of a schema, sorted by visitor then start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sessions {
    pub property_columns: Vec<Column>,
    pub rows: Vec<Session>,
}

/// A row opens a session when it is the visitor's first or its gap exceeds the threshold.
pub fn is_session_start(row: &EventUnionRow, idle_threshold_minutes: i64) -> bool {
    row.idle_time_minutes
        .map_or(true, |gap| gap > idle_threshold_minutes)
}

/// Renders a session identifier unique across visitors.
pub fn session_id(sequence_number: i64, anonymous_id: &str) -> String {
    format!("{} - {}", sequence_number, anonymous_id)
}

/// Partitions the union into sessions.
///
/// Rows without an `anonymous_id` belong to no visitor and open no session.
pub fn build(union: &EventUnion, idle_threshold_minutes: i64, patterns: &[String]) -> Sessions {
    let prop_idx: Vec<usize> = PropertySelector::new(patterns)
        .select_indices(&union.property_columns)
        .into_iter()
        .filter(|&i| !SESSION_BASE_COLUMNS.contains(&union.property_columns[i].name.as_str()))
        .collect();
    let property_columns: Vec<Column> = prop_idx
        .iter()
        .map(|&i| union.property_columns[i].clone())
        .collect();

    let mut rows: Vec<Session> = Vec::new();

    for row in &union.rows {
        let Some(anonymous_id) = row.anonymous_id.as_deref() else {
            continue;
        };
        if !is_session_start(row, idle_threshold_minutes) {
            continue;
        }

        let same_visitor = rows
            .last()
            .is_some_and(|prev| prev.anonymous_id == anonymous_id);
        let sequence_number = if same_visitor {
            let prev = rows.len() - 1;
            rows[prev].next_session_start_at = Some(row.received_at);
            rows[prev].session_sequence_number + 1
        } else {
            1
        };

        rows.push(Session {
            session_id: session_id(sequence_number, anonymous_id),
            anonymous_id: anonymous_id.to_string(),
            session_start_at: row.received_at,
            session_sequence_number: sequence_number,
            next_session_start_at: None,
            properties: prop_idx.iter().map(|&i| row.properties[i].clone()).collect(),
        });
    }

    debug!(sessions = rows.len(), "Built sessions");

    Sessions {
        property_columns,
        rows,
    }
}

impl Sessions {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.property_columns.iter().position(|c| c.name == name)
    }

    /// Sessions of one visitor, in start order.
    pub fn for_visitor<'a>(&'a self, anonymous_id: &'a str) -> impl Iterator<Item = &'a Session> + 'a {
        self.rows.iter().filter(move |s| s.anonymous_id == anonymous_id)
    }

    pub fn columns(&self) -> Vec<Column> {
        let mut columns = vec![
            Column::required("session_id", ColumnType::Text),
            Column::required("anonymous_id", ColumnType::Text),
            Column::required("session_start_at", ColumnType::Timestamp),
            Column::required("session_sequence_number", ColumnType::Integer),
            Column::new("next_session_start_at", ColumnType::Timestamp),
        ];
        columns.extend(self.property_columns.iter().cloned());
        columns
    }

    pub fn to_relation(&self) -> Relation {
        let rows = self
            .rows
            .iter()
            .map(|s| {
                let mut row = Vec::with_capacity(5 + s.properties.len());
                row.push(Value::Text(s.session_id.clone()));
                row.push(Value::Text(s.anonymous_id.clone()));
                row.push(Value::Timestamp(s.session_start_at));
                row.push(Value::Int(s.session_sequence_number));
                row.push(Value::from(s.next_session_start_at));
                row.extend(s.properties.iter().cloned());
                row
            })
            .collect();
        Relation {
            columns: self.columns(),
            rows,
        }
    }
}
