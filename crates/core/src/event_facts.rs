//! The sessionized fact table: every event joined to its owning session.
//!
//! An event matches the session of its visitor whose interval
//! `[session_start_at, next_session_start_at)` contains its `received_at`.
//! Campaign attribution is taken from the session, everything else from the event.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::event_union::{EventSource, EventUnion};
use crate::relation::{Column, ColumnType, Relation, Value};
use crate::selector::PropertySelector;
use crate::sessions::{Session, Sessions};

/// Marks the session-level campaign columns wherever it occurs in a name.
pub const CAMPAIGN_PREFIX: &str = "context_campaign";
/// Session column surfaced as `session_referrer`.
pub const REFERRER_COLUMN: &str = "context_page_referrer";

/// Columns the fact table emits itself; never propagated as properties.
pub const FACT_BASE_COLUMNS: &[&str] = &[
    "id",
    "anonymous_id",
    "received_at",
    "session_id",
    "session_sequence_number",
    "session_start_at",
    "event",
    "event_source",
    "session_referrer",
    "track_sequence_number",
    "source_sequence_number",
    "idle_time_seconds",
];

/// One fact row.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFact {
    pub id: Option<String>,
    pub anonymous_id: String,
    pub received_at: DateTime<Utc>,
    pub session_id: String,
    pub session_sequence_number: i64,
    pub session_start_at: DateTime<Utc>,
    pub event: Option<String>,
    pub event_source: EventSource,
    pub session_referrer: Value,
    pub track_sequence_number: i64,
    pub source_sequence_number: i64,
    pub idle_time_seconds: Option<i64>,
    /// Event-level values aligned with [`EventFacts::property_columns`].
    pub properties: Vec<Value>,
    /// Session-level values aligned with [`EventFacts::campaign_columns`].
    pub campaign: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFacts {
    pub property_columns: Vec<Column>,
    pub campaign_columns: Vec<Column>,
    referrer_type: Option<ColumnType>,
    pub rows: Vec<EventFact>,
}

/// Range-joins the union to its sessions and assembles the fact rows.
pub fn build(
    union: &EventUnion,
    sessions: &Sessions,
    patterns: &[String],
    campaign_prefix: &str,
) -> EventFacts {
    let exclude = [campaign_prefix.to_string()];
    let prop_idx: Vec<usize> = PropertySelector::new(patterns)
        .with_exclude(&exclude)
        .select_indices(&union.property_columns)
        .into_iter()
        .filter(|&i| !FACT_BASE_COLUMNS.contains(&union.property_columns[i].name.as_str()))
        .collect();
    let property_columns: Vec<Column> = prop_idx
        .iter()
        .map(|&i| union.property_columns[i].clone())
        .collect();

    let campaign_idx: Vec<usize> = sessions
        .property_columns
        .iter()
        .enumerate()
        // Same predicate as the event-level exclusion, so each column lands in one group.
        .filter(|(_, c)| c.name.contains(campaign_prefix))
        .map(|(i, _)| i)
        .collect();
    let campaign_columns: Vec<Column> = campaign_idx
        .iter()
        .map(|&i| sessions.property_columns[i].clone())
        .collect();

    let referrer_idx = sessions.property_index(REFERRER_COLUMN);
    if referrer_idx.is_none() {
        debug!(column = REFERRER_COLUMN, "Sessions carry no referrer; session_referrer is null");
    }

    let by_visitor = index_sessions(sessions);
    let mut track_seq: HashMap<&str, i64> = HashMap::new();
    let mut source_seq: HashMap<(&str, EventSource), i64> = HashMap::new();
    let mut rows = Vec::with_capacity(union.len());
    let mut unmatched = 0usize;

    // Union rows are ordered by visitor then received_at, so counting in
    // iteration order ranks events by received_at within each session.
    for event in &union.rows {
        let Some(visitor) = event.anonymous_id.as_deref() else {
            unmatched += 1;
            continue;
        };
        let Some(session) = by_visitor
            .get(visitor)
            .and_then(|owned| find_session(owned, event.received_at))
        else {
            unmatched += 1;
            continue;
        };

        let track = track_seq.entry(session.session_id.as_str()).or_insert(0);
        *track += 1;
        let source = source_seq
            .entry((session.session_id.as_str(), event.event_source))
            .or_insert(0);
        *source += 1;

        rows.push(EventFact {
            id: event.id.clone(),
            anonymous_id: session.anonymous_id.clone(),
            received_at: event.received_at,
            session_id: session.session_id.clone(),
            session_sequence_number: session.session_sequence_number,
            session_start_at: session.session_start_at,
            event: event.event.clone(),
            event_source: event.event_source,
            session_referrer: referrer_idx
                .map(|i| session.properties[i].clone())
                .unwrap_or(Value::Null),
            track_sequence_number: *track,
            source_sequence_number: *source,
            idle_time_seconds: event.idle_time_seconds,
            properties: prop_idx.iter().map(|&i| event.properties[i].clone()).collect(),
            campaign: campaign_idx
                .iter()
                .map(|&i| session.properties[i].clone())
                .collect(),
        });
    }

    if unmatched > 0 {
        warn!(unmatched, "Events without an owning session were not joined");
    }
    debug!(facts = rows.len(), "Built event facts");

    EventFacts {
        property_columns,
        campaign_columns,
        referrer_type: referrer_idx.map(|i| sessions.property_columns[i].column_type),
        rows,
    }
}

/// Sessions grouped per visitor, each group in start order.
fn index_sessions(sessions: &Sessions) -> HashMap<&str, Vec<&Session>> {
    let mut by_visitor: HashMap<&str, Vec<&Session>> = HashMap::new();
    for session in &sessions.rows {
        by_visitor
            .entry(session.anonymous_id.as_str())
            .or_default()
            .push(session);
    }
    for owned in by_visitor.values_mut() {
        owned.sort_by_key(|s| s.session_start_at);
    }
    by_visitor
}

/// The last session starting at or before `at`, if its interval contains `at`.
fn find_session<'a>(owned: &[&'a Session], at: DateTime<Utc>) -> Option<&'a Session> {
    let after = owned.partition_point(|s| s.session_start_at <= at);
    let candidate = owned.get(after.checked_sub(1)?)?;
    candidate.contains(at).then_some(*candidate)
}

impl EventFacts {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> Vec<Column> {
        let mut columns = vec![
            Column::new("id", ColumnType::Text),
            Column::required("anonymous_id", ColumnType::Text),
            Column::required("received_at", ColumnType::Timestamp),
            Column::required("session_id", ColumnType::Text),
            Column::required("session_sequence_number", ColumnType::Integer),
            Column::required("session_start_at", ColumnType::Timestamp),
            Column::new("event", ColumnType::Text),
            Column::required("event_source", ColumnType::Text),
            Column::new(
                "session_referrer",
                self.referrer_type.unwrap_or(ColumnType::Text),
            ),
            Column::required("track_sequence_number", ColumnType::Integer),
            Column::required("source_sequence_number", ColumnType::Integer),
            Column::new("idle_time_seconds", ColumnType::Integer),
        ];
        columns.extend(self.property_columns.iter().cloned());
        columns.extend(self.campaign_columns.iter().cloned());
        columns
    }

    pub fn to_relation(&self) -> Relation {
        let rows = self
            .rows
            .iter()
            .map(|f| {
                let mut row = Vec::with_capacity(12 + f.properties.len() + f.campaign.len());
                row.push(Value::from(f.id.clone()));
                row.push(Value::Text(f.anonymous_id.clone()));
                row.push(Value::Timestamp(f.received_at));
                row.push(Value::Text(f.session_id.clone()));
                row.push(Value::Int(f.session_sequence_number));
                row.push(Value::Timestamp(f.session_start_at));
                row.push(Value::from(f.event.clone()));
                row.push(Value::Text(f.event_source.as_str().to_string()));
                row.push(f.session_referrer.clone());
                row.push(Value::Int(f.track_sequence_number));
                row.push(Value::Int(f.source_sequence_number));
                row.push(Value::from(f.idle_time_seconds));
                row.extend(f.properties.iter().cloned());
                row.extend(f.campaign.iter().cloned());
                row
            })
            .collect();
        Relation {
            columns: self.columns(),
            rows,
        }
    }
}
