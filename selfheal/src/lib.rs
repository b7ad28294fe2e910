//! # Selfheal
//!
//! The extraction core of a self-healing data pipeline.
//!
//! Selfheal reads data from external sources through a [`Connector`](extraction::Connector)
//! and keeps the pipeline moving when those sources misbehave:
//!
//! - **Batched extraction**: Sequential offset batches sized from source type, volume and memory
//! - **Incremental extraction**: Persisted high watermarks that never move backwards
//! - **Retry with backoff**: Transient failures are retried with capped exponential delays
//! - **Circuit breakers**: Failing resources are isolated and retried after a cooldown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use selfheal::prelude::*;
//! use std::sync::Arc;
//!
//! let orchestrator = ExtractionOrchestrator::new(
//!     ExtractorConfig::default(),
//!     Arc::new(InMemoryStateStore::new()),
//! );
//!
//! let params = ExtractionParams::new()
//!     .with("table_name", "orders")
//!     .with("incremental_column", "updated_at");
//! let result = orchestrator.extract(&params, &connector).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod extraction;
pub mod observability;
pub mod resilience;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{BatchConfig, ExtractorConfig, IncrementalConfig, LoggingConfig};
    pub use crate::core::{ColumnType, Dataset, ExtractionParams, WatermarkValue};
    pub use crate::errors::{
        CircuitOpenError, Classify, ConnectorError, ErrorKind, ExtractionError, Result,
        StateStoreError, ValidationError,
    };
    pub use crate::extraction::{
        BatchExtractor, BatchMetadata, Connector, ExtractionIdentity, ExtractionMetadata,
        ExtractionOrchestrator, ExtractionResult, ExtractionStrategy, InMemoryStateStore,
        IncrementalMetadata, IncrementalTracker, SourceSchema, SourceType, StateStore,
    };
    pub use crate::observability::init_logging;
    pub use crate::resilience::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig, RetryExecutor,
    };
    pub use crate::utils::{Clock, Timestamp};
}
