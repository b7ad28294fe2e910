//! Capabilities the extraction core depends on.
//!
//! A [`Connector`] talks to one data source; a [`StateStore`] persists
//! watermark documents. Both are supplied by the host pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{Dataset, ExtractionParams};
use crate::errors::{ConnectorError, StateStoreError};

/// Broad family of a source, used to bias batch sizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// Object storage and files.
    Storage,
    /// Relational databases and warehouses.
    Relational,
    /// HTTP APIs.
    Api,
    /// Anything else.
    #[default]
    Unknown,
}

impl SourceType {
    /// Parses a source type or one of its common aliases.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "storage" | "gcs" | "s3" | "azure_blob" | "file" | "csv" | "parquet" => Self::Storage,
            "relational" | "database" | "sql" | "postgres" | "postgresql" | "mysql"
            | "bigquery" | "snowflake" => Self::Relational,
            "api" | "rest" | "http" | "graphql" => Self::Api,
            _ => Self::Unknown,
        }
    }

    /// Returns the canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Relational => "relational",
            Self::Api => "api",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of a source object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name.
    pub name: String,
    /// Source-specific type name.
    pub data_type: String,
    /// Whether the field may be null.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl FieldSchema {
    /// Creates a nullable field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
        }
    }
}

/// Schema of a table, file or endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSchema {
    /// The object described.
    pub object_name: String,
    /// Fields in source order.
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl SourceSchema {
    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A data source.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Identifier used for breaker names and state keys.
    fn source_id(&self) -> &str;

    /// Source family.
    fn source_type(&self) -> SourceType {
        SourceType::Unknown
    }

    /// Opens a session.
    async fn connect(&self) -> Result<bool, ConnectorError>;

    /// Closes the session.
    async fn disconnect(&self) -> Result<bool, ConnectorError>;

    /// Extracts rows. Batch and incremental callers add `offset`,
    /// `batch_size`, `from_timestamp`, `to_timestamp`, `from_value` or
    /// `from_version` to `params`.
    async fn extract(&self, params: &ExtractionParams) -> Result<Dataset, ConnectorError>;

    /// Describes an object.
    async fn get_source_schema(&self, object_name: &str) -> Result<SourceSchema, ConnectorError>;

    /// Estimates how many rows `params` would return, if the source can tell.
    async fn estimate_record_count(
        &self,
        _params: &ExtractionParams,
    ) -> Result<Option<u64>, ConnectorError> {
        Ok(None)
    }
}

/// Document store for watermark state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a document.
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Value>, StateStoreError>;

    /// Overwrites a document.
    async fn set(&self, collection: &str, doc_id: &str, document: Value) -> Result<(), StateStoreError>;

    /// Deletes a document. Returns false if it did not exist.
    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StateStoreError>;
}

/// In-memory state store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    documents: Arc<Mutex<HashMap<(String, String), Value>>>,
}

impl InMemoryStateStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.lock().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.lock().is_empty()
    }

    /// Returns a document without going through the async trait.
    #[must_use]
    pub fn document(&self, collection: &str, doc_id: &str) -> Option<Value> {
        self.documents
            .lock()
            .get(&(collection.to_string(), doc_id.to_string()))
            .cloned()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, collection: &str, doc_id: &str) -> Result<Option<Value>, StateStoreError> {
        Ok(self.document(collection, doc_id))
    }

    async fn set(&self, collection: &str, doc_id: &str, document: Value) -> Result<(), StateStoreError> {
        self.documents
            .lock()
            .insert((collection.to_string(), doc_id.to_string()), document);
        Ok(())
    }

    async fn delete(&self, collection: &str, doc_id: &str) -> Result<bool, StateStoreError> {
        Ok(self
            .documents
            .lock()
            .remove(&(collection.to_string(), doc_id.to_string()))
            .is_some())
    }
}
