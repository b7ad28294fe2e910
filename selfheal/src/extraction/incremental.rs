//! Incremental extraction with persisted high watermarks.
//!
//! Each [`ExtractionIdentity`] owns one watermark document. A run reads the
//! document, asks the connector for rows above the stored watermark, takes
//! the column maximum of what came back and commits it. The committed value
//! never moves backwards: a lower maximum is clamped to the stored value and
//! a commit that would regress the stored document is refused.
//!
//! Timestamp windows start `watermark_buffer_seconds` before the stored
//! watermark so late rows stamped just under the cutoff are read again
//! rather than skipped. Delivery is at-least-once.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use super::ports::{Connector, StateStore};
use super::state::{document_id, ExtractionIdentity, HistoryEntry, WatermarkState};
use crate::config::{seconds, IncrementalConfig};
use crate::core::{keys, ColumnType, Dataset, ExtractionParams, WatermarkValue};
use crate::errors::{ExtractionError, Result, StateStoreError, ValidationError};
use crate::resilience::{
    extract_breaker_name, state_store_breaker_name, CircuitBreakerRegistry, RetryConfig, RetryExecutor,
};
use crate::utils::{system_clock, Clock, Timestamp};

/// Per-run options after params have been layered over config.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalOptions {
    /// Whose watermark this run advances.
    pub identity: ExtractionIdentity,
    /// Type of the incremental column.
    pub column_type: ColumnType,
    /// Collection holding the watermark document.
    pub state_collection: String,
    /// First-run lookback for timestamp columns.
    pub lookback: chrono::Duration,
    /// Overlap subtracted from timestamp lower bounds.
    pub buffer: chrono::Duration,
}

impl IncrementalOptions {
    /// Resolves options. `table_name` and `incremental_column` are required.
    pub fn resolve(
        config: &IncrementalConfig,
        params: &ExtractionParams,
        connector: &dyn Connector,
    ) -> std::result::Result<Self, ValidationError> {
        let table_name = params.require_str(keys::TABLE_NAME)?;
        let incremental_column = params.require_str(keys::INCREMENTAL_COLUMN)?;
        let source_id = params
            .get_str(keys::SOURCE_ID)
            .unwrap_or_else(|| connector.source_id());
        let identity = ExtractionIdentity::new(source_id, table_name, incremental_column)?;

        let column_type = params
            .get_str(keys::COLUMN_TYPE)
            .map_or(ColumnType::Timestamp, ColumnType::parse);
        let state_collection = params
            .get_str(keys::STATE_COLLECTION)
            .unwrap_or(&config.state_collection)
            .to_string();
        let lookback_hours = params
            .get_f64(keys::LOOKBACK_WINDOW_HOURS)?
            .unwrap_or(config.lookback_window_hours);
        let buffer_seconds = params
            .get_f64(keys::WATERMARK_BUFFER_SECONDS)?
            .unwrap_or(config.watermark_buffer_seconds);

        Ok(Self {
            identity,
            column_type,
            state_collection,
            lookback: signed_seconds(lookback_hours * 3600.0),
            buffer: signed_seconds(buffer_seconds),
        })
    }
}

fn signed_seconds(value: f64) -> chrono::Duration {
    chrono::Duration::from_std(seconds(value)).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Everything decided before the connector is called.
#[derive(Debug, Clone)]
pub struct IncrementalWindow {
    /// Resolved options.
    pub options: IncrementalOptions,
    /// State key of the identity.
    pub extraction_key: String,
    /// True when no watermark was stored.
    pub first_run: bool,
    /// Stored watermark, or the seed on a first run.
    pub previous: Option<WatermarkValue>,
    /// Lower bound handed to the connector.
    pub lower_bound: Option<WatermarkValue>,
    /// Range parameters to merge into the extraction params.
    pub range_params: ExtractionParams,
    /// When the window was opened.
    pub opened_at: Timestamp,
}

/// Facts recorded with a watermark commit.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// Whose watermark is written.
    pub identity: ExtractionIdentity,
    /// Type of the incremental column.
    pub column_type: ColumnType,
    /// Collection holding the document.
    pub state_collection: String,
    /// Rows the run extracted.
    pub record_count: u64,
}

/// Summary of an incremental run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalMetadata {
    /// State key of the identity.
    pub extraction_key: String,
    /// Source identifier.
    pub source_id: String,
    /// Table or object name.
    pub table_name: String,
    /// Incremental column name.
    pub incremental_column: String,
    /// Type of the incremental column.
    pub column_type: ColumnType,
    /// Collection holding the document.
    pub state_collection: String,
    /// True when no watermark was stored before this run.
    pub first_run: bool,
    /// Stored watermark (or seed) before the run.
    pub previous_watermark: Option<Value>,
    /// Lower bound handed to the connector.
    pub lower_bound: Option<Value>,
    /// Watermark after the run.
    pub new_watermark: Option<Value>,
    /// True when the new watermark is above the previous one.
    pub watermark_advanced: bool,
    /// Rows extracted.
    pub record_count: u64,
    /// True when the state document was written.
    pub state_updated: bool,
}

/// Returns the new high watermark for a dataset.
///
/// An empty dataset, a missing column or a column with no readable cell
/// leaves `previous` unchanged. A column maximum below `previous`, or one
/// that cannot be compared with it, is clamped to `previous`.
#[must_use]
pub fn calculate_high_watermark(
    dataset: &Dataset,
    incremental_column: &str,
    previous: Option<&WatermarkValue>,
    column_type: &ColumnType,
) -> Option<WatermarkValue> {
    let Some(cells) = dataset.column_values(incremental_column) else {
        if !dataset.is_empty() {
            tracing::warn!(
                column = incremental_column,
                "Incremental column missing from dataset; keeping previous watermark"
            );
        }
        return previous.cloned();
    };

    let mut max: Option<WatermarkValue> = None;
    for value in cells.filter_map(|cell| column_type.parse_cell(cell)) {
        let replace = match &max {
            None => true,
            Some(current) => value.compare(current) == Some(Ordering::Greater),
        };
        if replace {
            max = Some(value);
        }
    }

    match (max, previous) {
        (None, previous) => previous.cloned(),
        (Some(max), None) => Some(max),
        (Some(max), Some(previous)) => match max.compare(previous) {
            Some(Ordering::Less) => {
                tracing::warn!(
                    column = incremental_column,
                    computed = %max,
                    previous = %previous,
                    "Computed watermark is behind the stored one; keeping stored watermark"
                );
                Some(previous.clone())
            }
            Some(_) => Some(max),
            None => {
                tracing::warn!(
                    column = incremental_column,
                    computed = %max,
                    previous = %previous,
                    "Computed watermark is not comparable with the stored one; keeping stored watermark"
                );
                Some(previous.clone())
            }
        },
    }
}

fn advanced(new: Option<&WatermarkValue>, previous: Option<&WatermarkValue>) -> bool {
    match (new, previous) {
        (Some(_), None) => true,
        (Some(new), Some(previous)) => new.compare(previous) == Some(Ordering::Greater),
        (None, _) => false,
    }
}

fn window_metadata(
    window: &IncrementalWindow,
    new_watermark: Option<&WatermarkValue>,
    watermark_advanced: bool,
    record_count: u64,
    state_updated: bool,
) -> IncrementalMetadata {
    let options = &window.options;
    IncrementalMetadata {
        extraction_key: window.extraction_key.clone(),
        source_id: options.identity.source_id.clone(),
        table_name: options.identity.table_name.clone(),
        incremental_column: options.identity.incremental_column.clone(),
        column_type: options.column_type.clone(),
        state_collection: options.state_collection.clone(),
        first_run: window.first_run,
        previous_watermark: window.previous.as_ref().map(WatermarkValue::to_json),
        lower_bound: window.lower_bound.as_ref().map(WatermarkValue::to_json),
        new_watermark: new_watermark.map(WatermarkValue::to_json),
        watermark_advanced,
        record_count,
        state_updated,
    }
}

/// Tracks high watermarks and runs incremental extractions.
#[derive(Clone)]
pub struct IncrementalTracker {
    store: Arc<dyn StateStore>,
    config: IncrementalConfig,
    retry: RetryConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for IncrementalTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrementalTracker")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl IncrementalTracker {
    /// Creates a tracker on the system clock.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        config: IncrementalConfig,
        retry: RetryConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self::with_clock(store, config, retry, breakers, system_clock())
    }

    /// Creates a tracker on the given clock.
    #[must_use]
    pub fn with_clock(
        store: Arc<dyn StateStore>,
        config: IncrementalConfig,
        retry: RetryConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            retry,
            breakers,
            clock,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    /// Extracts rows above the stored watermark and commits the new one.
    ///
    /// A failed state write does not fail the run; it is reported through
    /// [`IncrementalMetadata::state_updated`].
    pub async fn extract_incremental(
        &self,
        params: &ExtractionParams,
        connector: &dyn Connector,
    ) -> Result<(Dataset, IncrementalMetadata)> {
        let window = self.prepare_window(params, connector).await?;
        let request = params.merged(&window.range_params);

        let source_id = window.options.identity.source_id.clone();
        let executor = RetryExecutor::new(
            self.retry.clone(),
            self.breakers.get_or_create(&extract_breaker_name(&source_id)),
        );
        let dataset = executor
            .execute("extract_incremental", || async {
                connector.extract(&request).await.map_err(ExtractionError::from)
            })
            .await?;

        let metadata = self.commit_window(window, &dataset).await;
        Ok((dataset, metadata))
    }

    /// Validates params, loads the stored watermark and builds range params.
    pub async fn prepare_window(
        &self,
        params: &ExtractionParams,
        connector: &dyn Connector,
    ) -> Result<IncrementalWindow> {
        let options = IncrementalOptions::resolve(&self.config, params, connector)?;
        let extraction_key = options.identity.extraction_key();
        let state = self
            .get_extraction_state_in(&options.state_collection, &extraction_key)
            .await;

        let tracked = state.watermark(&options.column_type);
        if tracked.is_none() && state.is_tracked() {
            tracing::warn!(
                extraction_key = %extraction_key,
                column_type = %options.column_type,
                stored = ?state.last_value,
                "Stored watermark cannot be read as the configured column type; starting over"
            );
        }

        let opened_at = self.clock.now();
        let first_run = tracked.is_none();
        let lower_bound = match &tracked {
            Some(WatermarkValue::Timestamp(ts)) => Some(WatermarkValue::Timestamp(
                ts.checked_sub_signed(options.buffer).unwrap_or(*ts),
            )),
            Some(other) => Some(other.clone()),
            None => self.determine_initial_value(&options),
        };
        let previous = tracked.or_else(|| lower_bound.clone());
        let range_params = options.column_type.range_params(lower_bound.as_ref(), opened_at);

        tracing::info!(
            source_id = %options.identity.source_id,
            table_name = %options.identity.table_name,
            incremental_column = %options.identity.incremental_column,
            column_type = %options.column_type,
            first_run,
            lower_bound = ?lower_bound.as_ref().map(ToString::to_string),
            "Starting incremental extraction"
        );

        Ok(IncrementalWindow {
            options,
            extraction_key,
            first_run,
            previous,
            lower_bound,
            range_params,
            opened_at,
        })
    }

    /// Computes and commits the watermark for rows read through `window`.
    pub async fn commit_window(&self, window: IncrementalWindow, dataset: &Dataset) -> IncrementalMetadata {
        let options = &window.options;
        let new_watermark = calculate_high_watermark(
            dataset,
            &options.identity.incremental_column,
            window.previous.as_ref(),
            &options.column_type,
        );
        let watermark_advanced = advanced(new_watermark.as_ref(), window.previous.as_ref());
        let record_count = dataset.len() as u64;

        let state_updated = match (&new_watermark, watermark_advanced) {
            (Some(new_watermark), true) => {
                let update = StateUpdate {
                    identity: options.identity.clone(),
                    column_type: options.column_type.clone(),
                    state_collection: options.state_collection.clone(),
                    record_count,
                };
                self.update_extraction_state(&window.extraction_key, new_watermark, &update)
                    .await
            }
            _ => {
                tracing::info!(
                    extraction_key = %window.extraction_key,
                    records = record_count,
                    "Watermark did not advance; state left unchanged"
                );
                false
            }
        };

        window_metadata(&window, new_watermark.as_ref(), watermark_advanced, record_count, state_updated)
    }

    /// Closes `window` without touching its state.
    ///
    /// Used when only part of the window was read: committing the maximum
    /// of a partial read would move the next lower bound past unread rows.
    /// The reported watermark stays at the previous value.
    pub fn hold_window(window: IncrementalWindow, dataset: &Dataset, reason: &str) -> IncrementalMetadata {
        let record_count = dataset.len() as u64;
        tracing::warn!(
            extraction_key = %window.extraction_key,
            records = record_count,
            reason,
            "Window was not read to the end; state left unchanged"
        );
        window_metadata(&window, window.previous.as_ref(), false, record_count, false)
    }

    /// Reads the state document from the configured collection.
    ///
    /// Store failures that survive retries degrade to an empty state.
    pub async fn get_extraction_state(&self, extraction_key: &str) -> WatermarkState {
        self.get_extraction_state_in(&self.config.state_collection, extraction_key)
            .await
    }

    /// Reads the state document from `collection`, degrading on failure.
    pub async fn get_extraction_state_in(&self, collection: &str, extraction_key: &str) -> WatermarkState {
        match self.load_state(collection, extraction_key).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    collection,
                    extraction_key,
                    error = %err,
                    "Failed to read extraction state; continuing without it"
                );
                WatermarkState::default()
            }
        }
    }

    /// Returns the lower bound for an identity with no stored state.
    #[must_use]
    pub fn determine_initial_value(&self, options: &IncrementalOptions) -> Option<WatermarkValue> {
        let seed = options
            .column_type
            .seed_value(self.clock.now(), options.lookback);
        tracing::debug!(
            table_name = %options.identity.table_name,
            incremental_column = %options.identity.incremental_column,
            column_type = %options.column_type,
            seed = ?seed.as_ref().map(ToString::to_string),
            "Seeding first incremental window"
        );
        seed
    }

    /// Commits `new_watermark` and appends a history entry.
    ///
    /// The document is re-read first; a value below the stored watermark is
    /// refused. A stored document that no longer decodes is replaced. Returns
    /// false when nothing was written.
    pub async fn update_extraction_state(
        &self,
        extraction_key: &str,
        new_watermark: &WatermarkValue,
        update: &StateUpdate,
    ) -> bool {
        let collection = update.state_collection.as_str();
        let mut state = match self.load_state(collection, extraction_key).await {
            Ok(state) => state,
            Err(ExtractionError::StateStore(err @ StateStoreError::Malformed { .. })) => {
                tracing::warn!(
                    extraction_key,
                    error = %err,
                    "Stored extraction state is malformed; overwriting it"
                );
                WatermarkState::default()
            }
            Err(err) => {
                tracing::error!(
                    extraction_key,
                    error = %err,
                    "Failed to read extraction state before update; progress will be re-read next run"
                );
                return false;
            }
        };

        if let Some(stored) = state.watermark(&update.column_type) {
            if new_watermark.compare(&stored) == Some(Ordering::Less) {
                tracing::warn!(
                    extraction_key,
                    stored = %stored,
                    proposed = %new_watermark,
                    "Refusing to move stored watermark backwards"
                );
                return false;
            }
        }

        let now = self.clock.now();
        let persisted = new_watermark.to_json();
        state.last_value = Some(persisted.clone());
        state.last_updated = Some(now);
        state.source_id.clone_from(&update.identity.source_id);
        state.table_name.clone_from(&update.identity.table_name);
        state.incremental_column.clone_from(&update.identity.incremental_column);
        state.column_type = update.column_type.clone();
        state.push_history(
            HistoryEntry {
                timestamp: now,
                watermark: persisted,
                record_count: update.record_count,
            },
            self.config.history_limit.max(1),
        );

        let document = match state.to_document() {
            Ok(document) => document,
            Err(err) => {
                tracing::error!(extraction_key, error = %err, "Failed to encode extraction state");
                return false;
            }
        };

        let doc_id = document_id(extraction_key);
        let result = self
            .state_executor(collection)
            .execute("set_extraction_state", || async {
                self.store
                    .set(collection, &doc_id, document.clone())
                    .await
                    .map_err(ExtractionError::from)
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    extraction_key,
                    watermark = %new_watermark,
                    records = update.record_count,
                    "Committed new watermark"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    extraction_key,
                    error = %err,
                    "Failed to persist extraction state; progress will be re-read next run"
                );
                false
            }
        }
    }

    /// Deletes the stored watermark in the configured collection.
    pub async fn reset_extraction_state(&self, identity: &ExtractionIdentity) -> bool {
        self.reset_extraction_state_in(&self.config.state_collection, identity)
            .await
    }

    /// Deletes the stored watermark in `collection`. The next run starts from the seed.
    pub async fn reset_extraction_state_in(&self, collection: &str, identity: &ExtractionIdentity) -> bool {
        let doc_id = identity.document_id();
        let result = self
            .state_executor(collection)
            .execute("delete_extraction_state", || async {
                self.store
                    .delete(collection, &doc_id)
                    .await
                    .map_err(ExtractionError::from)
            })
            .await;

        match result {
            Ok(existed) => {
                tracing::info!(
                    source_id = %identity.source_id,
                    table_name = %identity.table_name,
                    incremental_column = %identity.incremental_column,
                    existed,
                    "Reset extraction state"
                );
                true
            }
            Err(err) => {
                tracing::error!(doc_id = %doc_id, error = %err, "Failed to reset extraction state");
                false
            }
        }
    }

    async fn load_state(&self, collection: &str, extraction_key: &str) -> Result<WatermarkState> {
        let doc_id = document_id(extraction_key);
        let document = self
            .state_executor(collection)
            .execute("get_extraction_state", || async {
                self.store
                    .get(collection, &doc_id)
                    .await
                    .map_err(ExtractionError::from)
            })
            .await?;

        match document {
            Some(document) => Ok(WatermarkState::from_document(&doc_id, document)?),
            None => Ok(WatermarkState::default()),
        }
    }

    fn state_executor(&self, collection: &str) -> RetryExecutor {
        RetryExecutor::new(
            self.retry.clone(),
            self.breakers.get_or_create(&state_store_breaker_name(collection)),
        )
    }
}
