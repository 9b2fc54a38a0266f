//! Tabular data model shared by the builders and the warehouse backends.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, SchemaErrorCode};

/// Fully qualified relation name (`schema.name`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelationRef {
    pub schema: String,
    pub name: String,
}

impl RelationRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RelationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Logical column type, independent of any warehouse dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Timestamp,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    /// False only for derived columns that can never hold null.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Text form of a scalar value; `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Timestamp(ts) => Some(ts.to_rfc3339()),
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            Self::Text(s) => parse_timestamp(s),
            _ => None,
        }
    }

    /// Converts the value so it fits a column of `column_type`.
    ///
    /// Only widening to text is lossless for every input; other targets
    /// reject values that do not parse.
    pub fn coerce(self, column_type: ColumnType) -> Result<Value> {
        let coerced = match (self, column_type) {
            (Self::Null, _) => Self::Null,
            (v @ Self::Text(_), ColumnType::Text) => v,
            (v, ColumnType::Text) => Self::Text(v.to_text().unwrap_or_default()),
            (v @ Self::Int(_), ColumnType::Integer) => v,
            (Self::Text(s), ColumnType::Integer) => Self::Int(
                s.trim()
                    .parse()
                    .map_err(|_| invalid_value(&s, column_type))?,
            ),
            (v @ Self::Float(_), ColumnType::Float) => v,
            (Self::Int(i), ColumnType::Float) => Self::Float(i as f64),
            (Self::Text(s), ColumnType::Float) => Self::Float(
                s.trim()
                    .parse()
                    .map_err(|_| invalid_value(&s, column_type))?,
            ),
            (v @ Self::Bool(_), ColumnType::Boolean) => v,
            (Self::Int(i), ColumnType::Boolean) => Self::Bool(i != 0),
            (Self::Text(s), ColumnType::Boolean) => match s.trim() {
                "true" | "t" | "1" => Self::Bool(true),
                "false" | "f" | "0" => Self::Bool(false),
                _ => return Err(invalid_value(&s, column_type)),
            },
            (v @ Self::Timestamp(_), ColumnType::Timestamp) => v,
            (Self::Text(s), ColumnType::Timestamp) => Self::Timestamp(
                parse_timestamp(&s).ok_or_else(|| invalid_value(&s, column_type))?,
            ),
            (v, t) => return Err(invalid_value(&format!("{:?}", v), t)),
        };
        Ok(coerced)
    }

    /// Decodes a JSON cell as produced by a warehouse row export.
    pub fn from_json(json: &serde_json::Value, column_type: ColumnType) -> Result<Value> {
        let raw = match json {
            serde_json::Value::Null => return Ok(Self::Null),
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Self::Text(s.clone()),
            other => Self::Text(other.to_string()),
        };
        raw.coerce(column_type)
    }

    /// Encodes the value as JSON, rendering timestamps with `timestamp_format`.
    pub fn to_json(&self, timestamp_format: &str) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Timestamp(ts) => serde_json::Value::String(ts.format(timestamp_format).to_string()),
        }
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map(Value::Text).unwrap_or(Value::Null)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::Int).unwrap_or(Value::Null)
    }
}

impl From<Option<DateTime<Utc>>> for Value {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        v.map(Value::Timestamp).unwrap_or(Value::Null)
    }
}

fn invalid_value(raw: &str, column_type: ColumnType) -> Error {
    Error::schema(
        SchemaErrorCode::InvalidType,
        format!("value {:?} is not a valid {:?}", raw, column_type),
    )
}

/// Parses the timestamp renderings warehouses emit: RFC 3339, or naive
/// `YYYY-MM-DD HH:MM:SS[.fff]` (with space or `T`) interpreted as UTC.
/// A bare `YYYY-MM-DD` date is midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// An in-memory relation: ordered columns plus row-major values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Value>>,
}

impl Relation {
    pub fn new(columns: Vec<Column>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row; the row must match the column count.
    pub fn push(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::internal(format!(
                "row has {} values, relation has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }
}

/// Physical clustering hints handed to the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutHints {
    pub distribution_key: Option<String>,
    pub sort_key: Option<String>,
}

impl LayoutHints {
    /// Distribution on the first selected column, sort on the third.
    pub fn from_columns(columns: &[Column]) -> Self {
        Self {
            distribution_key: columns.first().map(|c| c.name.clone()),
            sort_key: columns.get(2).map(|c| c.name.clone()),
        }
    }
}

/// Number of whole-second boundaries crossed between `from` and `to`.
pub fn datediff_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.timestamp() - from.timestamp()
}

/// Number of minute boundaries crossed between `from` and `to`.
pub fn datediff_minutes(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    to.timestamp().div_euclid(60) - from.timestamp().div_euclid(60)
}
