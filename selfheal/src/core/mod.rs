//! Core value types for the extraction core.
//!
//! This module contains the types handed between connectors and the
//! extraction components:
//! - Tabular dataset with row concatenation
//! - Extraction parameter mapping
//! - Incremental column types and watermark values

mod dataset;
mod params;
mod watermark;

pub use dataset::{Concatenated, Dataset, DatasetError, Row};
pub use params::{keys, ExtractionParams};
pub use watermark::{ColumnType, WatermarkValue};
