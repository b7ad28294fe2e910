//! Extraction parameter mapping.
//!
//! Connectors receive a plain JSON object. The recognised option names are
//! collected in [`keys`]; anything else passes through untouched so that
//! connector-specific options (queries, prefixes, endpoints) survive batching
//! and incremental windowing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ValidationError;

/// Recognised parameter names.
pub mod keys {
    /// Explicit batch size.
    pub const BATCH_SIZE: &str = "batch_size";
    /// Upper bound on the number of batches.
    pub const MAX_BATCHES: &str = "max_batches";
    /// Wall-clock budget for a batched extraction.
    pub const BATCH_TIMEOUT_SECONDS: &str = "batch_timeout_seconds";
    /// Lower clamp for computed batch sizes.
    pub const MIN_BATCH_SIZE: &str = "min_batch_size";
    /// Upper clamp for computed batch sizes.
    pub const MAX_BATCH_SIZE: &str = "max_batch_size";
    /// Memory budget for one batch, in megabytes.
    pub const MEMORY_LIMIT_MB: &str = "memory_limit_mb";
    /// Average record size estimate, in bytes.
    pub const AVG_RECORD_SIZE_BYTES: &str = "avg_record_size_bytes";
    /// Estimated number of records in the extraction.
    pub const ESTIMATED_TOTAL_RECORDS: &str = "estimated_total_records";
    /// Whether to return per-batch outcomes in the metadata.
    pub const INCLUDE_BATCH_DETAILS: &str = "include_batch_details";
    /// State store collection for watermark documents.
    pub const STATE_COLLECTION: &str = "state_collection";
    /// First-run lookback for timestamp columns.
    pub const LOOKBACK_WINDOW_HOURS: &str = "lookback_window_hours";
    /// Overlap subtracted from timestamp lower bounds.
    pub const WATERMARK_BUFFER_SECONDS: &str = "watermark_buffer_seconds";
    /// Incremental column type.
    pub const COLUMN_TYPE: &str = "column_type";
    /// Source identifier override.
    pub const SOURCE_ID: &str = "source_id";
    /// Source type override.
    pub const SOURCE_TYPE: &str = "source_type";
    /// Table or object name.
    pub const TABLE_NAME: &str = "table_name";
    /// Incremental column name.
    pub const INCREMENTAL_COLUMN: &str = "incremental_column";
    /// Explicit strategy selection.
    pub const EXTRACTION_MODE: &str = "extraction_mode";

    /// Injected per batch: 1-based batch number.
    pub const BATCH_NUMBER: &str = "batch_number";
    /// Injected per batch: row offset.
    pub const OFFSET: &str = "offset";
    /// Injected per batch: source identity and timing.
    pub const BATCH_CONTEXT: &str = "batch_context";
    /// Injected for timestamp windows.
    pub const FROM_TIMESTAMP: &str = "from_timestamp";
    /// Injected for timestamp windows.
    pub const TO_TIMESTAMP: &str = "to_timestamp";
    /// Injected for sequence, numeric and string windows.
    pub const FROM_VALUE: &str = "from_value";
    /// Injected for version windows.
    pub const FROM_VERSION: &str = "from_version";
}

/// JSON object of extraction options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionParams(Map<String, Value>);

impl ExtractionParams {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds parameters from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(ValidationError::new(format!(
                "extraction parameters must be an object, got {other}"
            ))),
        }
    }

    /// Sets a parameter.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Inserts a parameter, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Returns a raw value. `null` is treated as absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Returns true if the key holds a non-null value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Returns a non-empty string value.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Returns a required non-empty string value.
    pub fn require_str(&self, key: &str) -> Result<&str, ValidationError> {
        self.get_str(key).ok_or_else(|| ValidationError::missing(key))
    }

    /// Returns a non-negative integer value.
    ///
    /// Integral floats and numeric strings are accepted.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ValidationError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64().or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| f as u64)
            }),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| ValidationError::invalid(key, "must be a non-negative integer"))
    }

    /// Returns a finite non-negative number.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, ValidationError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        parsed
            .filter(|f| f.is_finite() && *f >= 0.0)
            .map(Some)
            .ok_or_else(|| ValidationError::invalid(key, "must be a non-negative number"))
    }

    /// Returns a boolean value.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ValidationError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(ValidationError::invalid(key, "must be a boolean")),
        }
    }

    /// Returns a copy with `overrides` layered on top.
    #[must_use]
    pub fn merged(&self, overrides: &Self) -> Self {
        let mut out = self.0.clone();
        for (k, v) in &overrides.0 {
            out.insert(k.clone(), v.clone());
        }
        Self(out)
    }

    /// Returns the underlying map.
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Converts into a JSON value.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for ExtractionParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
