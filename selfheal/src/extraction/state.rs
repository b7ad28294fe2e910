//! Persisted watermark documents.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ColumnType, WatermarkValue};
use crate::errors::{StateStoreError, ValidationError};
use crate::utils::Timestamp;

/// The triple that owns one watermark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtractionIdentity {
    /// Source identifier.
    pub source_id: String,
    /// Table or object name.
    pub table_name: String,
    /// Incremental column name.
    pub incremental_column: String,
}

impl ExtractionIdentity {
    /// Creates an identity. Every part must be non-empty.
    pub fn new(
        source_id: impl Into<String>,
        table_name: impl Into<String>,
        incremental_column: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let identity = Self {
            source_id: source_id.into().trim().to_string(),
            table_name: table_name.into().trim().to_string(),
            incremental_column: incremental_column.into().trim().to_string(),
        };
        for (field, value) in [
            ("source_id", &identity.source_id),
            ("table_name", &identity.table_name),
            ("incremental_column", &identity.incremental_column),
        ] {
            if value.is_empty() {
                return Err(ValidationError::missing(field));
            }
        }
        Ok(identity)
    }

    /// Returns the stable state key: MD5 hex of `source:table:column`.
    #[must_use]
    pub fn extraction_key(&self) -> String {
        let raw = format!(
            "{}:{}:{}",
            self.source_id, self.table_name, self.incremental_column
        );
        hex::encode(Md5::digest(raw.as_bytes()))
    }

    /// Returns the state document id.
    #[must_use]
    pub fn document_id(&self) -> String {
        document_id(&self.extraction_key())
    }
}

/// Returns the state document id for an extraction key.
#[must_use]
pub fn document_id(extraction_key: &str) -> String {
    format!("state_{extraction_key}")
}

/// One committed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the state was written.
    pub timestamp: Timestamp,
    /// The watermark committed by the run.
    pub watermark: Value,
    /// Rows the run extracted.
    pub record_count: u64,
}

/// Stored watermark for one [`ExtractionIdentity`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatermarkState {
    /// Highest committed watermark, in persisted JSON form.
    #[serde(default)]
    pub last_value: Option<Value>,
    /// When the document was last written.
    #[serde(default)]
    pub last_updated: Option<Timestamp>,
    /// Most recent runs, oldest first.
    #[serde(default)]
    pub extraction_history: Vec<HistoryEntry>,
    /// Source identifier.
    #[serde(default)]
    pub source_id: String,
    /// Table or object name.
    #[serde(default)]
    pub table_name: String,
    /// Incremental column name.
    #[serde(default)]
    pub incremental_column: String,
    /// Column type the watermark was stored under.
    #[serde(default)]
    pub column_type: ColumnType,
}

impl WatermarkState {
    /// Returns true once a watermark has been committed.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.last_value.as_ref().is_some_and(|v| !v.is_null())
    }

    /// Decodes the committed watermark.
    #[must_use]
    pub fn watermark(&self, column_type: &ColumnType) -> Option<WatermarkValue> {
        self.last_value
            .as_ref()
            .and_then(|v| WatermarkValue::from_json(v, column_type))
    }

    /// Appends a history entry, dropping the oldest beyond `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.extraction_history.push(entry);
        let excess = self.extraction_history.len().saturating_sub(limit);
        if excess > 0 {
            self.extraction_history.drain(..excess);
        }
    }

    /// Decodes a stored document.
    pub fn from_document(doc_id: &str, document: Value) -> Result<Self, StateStoreError> {
        serde_json::from_value(document)
            .map_err(|e| StateStoreError::malformed(doc_id, e.to_string()))
    }

    /// Encodes the document for storage.
    pub fn to_document(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
