//! Error types for the extraction core.
//!
//! Every error carries an [`ErrorKind`] classification. The retry executor
//! uses it to decide whether a failure is worth another attempt, and circuit
//! breakers use it to decide whether a failure says anything about the health
//! of the remote resource.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = ExtractionError> = std::result::Result<T, E>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not reach or open the resource.
    Connection,
    /// The remote operation timed out.
    Timeout,
    /// The connection was reset mid-operation.
    ConnectionReset,
    /// The underlying handle was already closed.
    ResourceClosed,
    /// The remote side dropped the session.
    Disconnected,
    /// The source accepted the request but failed to produce data.
    Extraction,
    /// Schema discovery failed.
    Schema,
    /// Caller-supplied parameters were rejected.
    Validation,
    /// The state store failed in a non-transient way.
    StateStore,
    /// A circuit breaker refused the call.
    CircuitOpen,
    /// Configuration could not be loaded or applied.
    Configuration,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Returns the kinds that are retried when no allow-list is configured.
    #[must_use]
    pub fn transient_defaults() -> Vec<Self> {
        vec![
            Self::Connection,
            Self::Timeout,
            Self::ConnectionReset,
            Self::ResourceClosed,
            Self::Disconnected,
        ]
    }

    /// Returns true for transport-level failures.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection
                | Self::Timeout
                | Self::ConnectionReset
                | Self::ResourceClosed
                | Self::Disconnected
        )
    }

    /// Returns true when a failure of this kind should be charged to a breaker.
    ///
    /// Caller mistakes and breaker refusals say nothing about resource health.
    #[must_use]
    pub fn counts_against_breaker(self) -> bool {
        !matches!(self, Self::Validation | Self::CircuitOpen | Self::Configuration)
    }
}

/// Types that can report an [`ErrorKind`].
pub trait Classify {
    /// Returns the classification of this error.
    fn kind(&self) -> ErrorKind;
}

/// The main error type for extraction operations.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// Extraction parameters were rejected before any I/O happened.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// A circuit breaker is open for the target resource.
    #[error("{0}")]
    CircuitOpen(#[from] CircuitOpenError),

    /// A connector call failed.
    #[error("{0}")]
    Connector(#[from] ConnectorError),

    /// A state store call failed.
    #[error("{0}")]
    StateStore(#[from] StateStoreError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for ExtractionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Connector(err) => err.kind(),
            Self::StateStore(err) => err.kind(),
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

impl ExtractionError {
    /// Returns true if this is a breaker refusal rather than an operation failure.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let type_name = match self {
            Self::Validation(_) => "ValidationError",
            Self::CircuitOpen(_) => "CircuitOpenError",
            Self::Connector(_) => "ConnectorError",
            Self::StateStore(_) => "StateStoreError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Serialization(_) => "SerializationError",
            Self::Io(_) => "IoError",
        };
        map.insert("type".to_string(), serde_json::json!(type_name));
        map.insert("kind".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));

        if let Self::CircuitOpen(err) = self {
            map.insert("breaker".to_string(), serde_json::json!(err.breaker));
            map.insert(
                "retry_after_seconds".to_string(),
                serde_json::json!(err.retry_after.as_secs_f64()),
            );
        }
        if let Self::Validation(ValidationError {
            field: Some(field), ..
        }) = self
        {
            map.insert("field".to_string(), serde_json::json!(field));
        }

        map
    }
}

/// Error raised when extraction parameters are missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid extraction parameters: {message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// The offending parameter, if known.
    pub field: Option<String>,
}

impl ValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            field: None,
        }
    }

    /// Creates an error for a required parameter that was not supplied.
    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("'{field}' is required"),
            field: Some(field),
        }
    }

    /// Creates an error for a parameter with the wrong shape.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            message: format!("'{field}' {}", reason.into()),
            field: Some(field),
        }
    }
}

/// Error raised instead of calling a resource whose breaker is open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{breaker}' is open; retry in {:.1}s", .retry_after.as_secs_f64())]
pub struct CircuitOpenError {
    /// Name of the breaker that refused the call.
    pub breaker: String,
    /// Estimated time until the breaker admits a trial request.
    pub retry_after: Duration,
    /// The failure that tripped the breaker, when known.
    pub last_error: Option<String>,
}

impl CircuitOpenError {
    /// Creates a new circuit-open error.
    #[must_use]
    pub fn new(breaker: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            breaker: breaker.into(),
            retry_after,
            last_error: None,
        }
    }

    /// Attaches the failure that tripped the breaker.
    #[must_use]
    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Errors surfaced by connector implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    /// Could not establish a session with the source.
    #[error("Connection to '{source_id}' failed: {message}")]
    Connection {
        /// The source identifier.
        source_id: String,
        /// Failure detail.
        message: String,
    },

    /// The remote call exceeded its own timeout.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The connection was reset by the peer.
    #[error("Connection reset: {0}")]
    ConnectionReset(String),

    /// The connector handle was already closed.
    #[error("Resource closed: {0}")]
    ResourceClosed(String),

    /// The session was dropped by the source.
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// The source failed to produce data for an accepted request.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// Schema discovery failed.
    #[error("Schema lookup for '{object_name}' failed: {message}")]
    Schema {
        /// The object whose schema was requested.
        object_name: String,
        /// Failure detail.
        message: String,
    },

    /// The connector rejected the parameters it was given.
    #[error("Invalid connector parameters: {0}")]
    InvalidParams(String),
}

impl ConnectorError {
    /// Creates a connection error.
    #[must_use]
    pub fn connection(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            source_id: source_id.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Creates an extraction error.
    #[must_use]
    pub fn extraction(message: impl Into<String>) -> Self {
        Self::Extraction(message.into())
    }

    /// Creates a schema error.
    #[must_use]
    pub fn schema(object_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            object_name: object_name.into(),
            message: message.into(),
        }
    }
}

impl Classify for ConnectorError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectionReset(_) => ErrorKind::ConnectionReset,
            Self::ResourceClosed(_) => ErrorKind::ResourceClosed,
            Self::Disconnected(_) => ErrorKind::Disconnected,
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Schema { .. } => ErrorKind::Schema,
            Self::InvalidParams(_) => ErrorKind::Validation,
        }
    }
}

/// Errors surfaced by state store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateStoreError {
    /// The store could not be reached.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("State store timed out: {0}")]
    Timeout(String),

    /// A stored document could not be decoded.
    #[error("State document '{doc_id}' is malformed: {message}")]
    Malformed {
        /// The document id.
        doc_id: String,
        /// Decoding failure detail.
        message: String,
    },

    /// The store refused the write.
    #[error("State store rejected write: {0}")]
    Rejected(String),
}

impl StateStoreError {
    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Creates a malformed-document error.
    #[must_use]
    pub fn malformed(doc_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            doc_id: doc_id.into(),
            message: message.into(),
        }
    }
}

impl Classify for StateStoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Connection,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Malformed { .. } | Self::Rejected(_) => ErrorKind::StateStore,
        }
    }
}
