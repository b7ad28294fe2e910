//! Incremental column types and watermark values.
//!
//! Every per-type decision (how to seed a first run, how to read a cell, how
//! two values compare and which range parameters a connector receives) is a
//! method on [`ColumnType`] or [`WatermarkValue`], so adding a type means
//! adding one match arm per operation.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::params::{keys, ExtractionParams};
use crate::utils::{format_iso8601, parse_timestamp, parse_timestamp_value, Timestamp};

/// Kind of values held by an incremental column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ColumnType {
    /// Date-times, compared chronologically.
    #[default]
    Timestamp,
    /// Monotone integer ids.
    Sequence,
    /// Arbitrary numbers.
    Numeric,
    /// Row version counters.
    Version,
    /// Lexicographically ordered strings.
    String,
    /// A type name this crate does not know.
    Other(String),
}

impl ColumnType {
    /// Parses a type name, case-insensitively. Unknown names become [`ColumnType::Other`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Self::Timestamp,
            "sequence" => Self::Sequence,
            "numeric" => Self::Numeric,
            "version" => Self::Version,
            "string" => Self::String,
            other => {
                tracing::warn!(column_type = other, "Unknown incremental column type");
                Self::Other(other.to_string())
            }
        }
    }

    /// Returns the canonical name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Sequence => "sequence",
            Self::Numeric => "numeric",
            Self::Version => "version",
            Self::String => "string",
            Self::Other(name) => name,
        }
    }

    /// Returns the lower bound used when no state has been stored yet.
    ///
    /// Timestamp columns start `lookback` before `now` to bound the cost of a
    /// first run; unknown types have no seed.
    #[must_use]
    pub fn seed_value(&self, now: Timestamp, lookback: chrono::Duration) -> Option<WatermarkValue> {
        match self {
            Self::Timestamp => Some(WatermarkValue::Timestamp(
                now.checked_sub_signed(lookback).unwrap_or(now),
            )),
            Self::Sequence | Self::Numeric | Self::Version => Some(WatermarkValue::Sequence(0)),
            Self::String => Some(WatermarkValue::Text(String::new())),
            Self::Other(_) => None,
        }
    }

    /// Reads one cell of an incremental column. `null` and unparseable cells yield `None`.
    #[must_use]
    pub fn parse_cell(&self, cell: &Value) -> Option<WatermarkValue> {
        match self {
            Self::Timestamp => parse_timestamp_value(cell).ok().map(WatermarkValue::Timestamp),
            Self::Sequence | Self::Numeric | Self::Version => number_cell(cell),
            Self::String => match cell {
                Value::String(s) => Some(WatermarkValue::Text(s.clone())),
                Value::Number(n) => Some(WatermarkValue::Text(n.to_string())),
                Value::Bool(b) => Some(WatermarkValue::Text(b.to_string())),
                _ => None,
            },
            Self::Other(_) => match cell {
                Value::String(s) => Some(WatermarkValue::Text(s.clone())),
                Value::Number(_) => number_cell(cell),
                _ => None,
            },
        }
    }

    /// Builds the range parameters handed to a connector.
    ///
    /// A missing lower bound is passed as `null`.
    #[must_use]
    pub fn range_params(&self, lower: Option<&WatermarkValue>, now: Timestamp) -> ExtractionParams {
        let lower = lower.map_or(Value::Null, WatermarkValue::to_json);
        match self {
            Self::Timestamp => ExtractionParams::new()
                .with(keys::FROM_TIMESTAMP, lower)
                .with(keys::TO_TIMESTAMP, format_iso8601(&now)),
            Self::Version => ExtractionParams::new().with(keys::FROM_VERSION, lower),
            Self::Sequence | Self::Numeric | Self::String | Self::Other(_) => {
                ExtractionParams::new().with(keys::FROM_VALUE, lower)
            }
        }
    }
}

impl From<String> for ColumnType {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<ColumnType> for String {
    fn from(column_type: ColumnType) -> Self {
        column_type.as_str().to_string()
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn number_cell(cell: &Value) -> Option<WatermarkValue> {
    match cell {
        Value::Number(n) => n
            .as_i64()
            .map(WatermarkValue::Sequence)
            .or_else(|| n.as_f64().map(WatermarkValue::Numeric)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .map(WatermarkValue::Sequence)
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(WatermarkValue::Numeric))
        }
        _ => None,
    }
}

/// A high-watermark value.
#[derive(Debug, Clone, PartialEq)]
pub enum WatermarkValue {
    /// A UTC date-time.
    Timestamp(Timestamp),
    /// An integer.
    Sequence(i64),
    /// A float.
    Numeric(f64),
    /// A string.
    Text(String),
}

impl WatermarkValue {
    /// Converts to the persisted JSON form. Timestamps become ISO-8601 strings.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Timestamp(ts) => Value::String(format_iso8601(ts)),
            Self::Sequence(n) => Value::from(*n),
            Self::Numeric(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    /// Reads a persisted value back using the column type it was stored under.
    #[must_use]
    pub fn from_json(value: &Value, column_type: &ColumnType) -> Option<Self> {
        column_type.parse_cell(value)
    }

    /// Compares two values.
    ///
    /// Timestamps compare with text by parsing the text as a date-time;
    /// integers and floats compare numerically. Other pairings are
    /// incomparable and return `None`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Text(b)) => parse_timestamp(b).ok().map(|b| a.cmp(&b)),
            (Self::Text(a), Self::Timestamp(b)) => parse_timestamp(a).ok().map(|a| a.cmp(b)),
            (Self::Sequence(a), Self::Sequence(b)) => Some(a.cmp(b)),
            (Self::Sequence(a), Self::Numeric(b)) => (*a as f64).partial_cmp(b),
            (Self::Numeric(a), Self::Sequence(b)) => a.partial_cmp(&(*b as f64)),
            (Self::Numeric(a), Self::Numeric(b)) => a.partial_cmp(b),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Returns the timestamp, if this is one.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl Serialize for WatermarkValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp(ts) => f.write_str(&format_iso8601(ts)),
            Self::Sequence(n) => write!(f, "{n}"),
            Self::Numeric(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}
