//! Extraction components.
//!
//! This module contains:
//! - Connector and state store ports
//! - Batch sizing, batched extraction and batch statistics
//! - Watermark state and the incremental tracker
//! - The orchestrator that selects a strategy per call

mod batch;
mod incremental;
mod orchestrator;
mod ports;
mod sizing;
mod state;
mod stats;


pub use batch::{BatchExtractor, BatchMetadata, BatchOptions, StopReason};
pub use incremental::{
    calculate_high_watermark, IncrementalMetadata, IncrementalOptions, IncrementalTracker,
    IncrementalWindow, StateUpdate,
};
pub use orchestrator::{
    ExtractionMetadata, ExtractionOrchestrator, ExtractionResult, ExtractionStats,
    ExtractionStrategy,
};
pub use ports::{
    Connector, FieldSchema, InMemoryStateStore, SourceSchema, SourceType, StateStore,
};
pub use sizing::{calculate_optimal_batch_size, BatchSizeBounds, BatchSizingInput};
pub use state::{document_id, ExtractionIdentity, HistoryEntry, WatermarkState};
pub use stats::{BatchOutcome, BatchStats, StatsError, BATCH_HISTORY_LIMIT};
