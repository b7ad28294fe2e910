//! Strategy selection and connector session handling.
//!
//! The orchestrator owns the breaker registry, the batch extractor and the
//! incremental tracker. One call to [`ExtractionOrchestrator::extract`]
//! validates params, opens a connector session, runs the selected strategy
//! and closes the session again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use super::batch::{BatchExtractor, BatchMetadata, BatchOptions, StopReason};
use super::incremental::{IncrementalMetadata, IncrementalOptions, IncrementalTracker};
use super::ports::{Connector, SourceSchema, StateStore};
use super::state::ExtractionIdentity;
use super::stats::BatchStats;
use crate::config::ExtractorConfig;
use crate::core::{keys, Dataset, ExtractionParams};
use crate::errors::{ConnectorError, ExtractionError, Result, ValidationError};
use crate::resilience::{
    extract_breaker_name, CircuitBreakerRegistry, CircuitBreakerState, RetryExecutor,
};
use crate::utils::{system_clock, Clock, Timestamp};

/// How a source is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    /// One request for everything.
    Full,
    /// Sequential offset batches.
    Batch,
    /// One request above the stored watermark.
    Incremental,
    /// Offset batches above the stored watermark.
    IncrementalBatch,
}

impl ExtractionStrategy {
    /// Returns the strategy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Batch => "batch",
            Self::Incremental => "incremental",
            Self::IncrementalBatch => "incremental_batch",
        }
    }

    /// Picks a strategy from `extraction_mode`, or infers one.
    ///
    /// Without a mode, `incremental_column` selects incremental extraction
    /// and `batch_size` or `max_batches` selects batching.
    pub fn select(params: &ExtractionParams) -> std::result::Result<Self, ValidationError> {
        if let Some(mode) = params.get_str(keys::EXTRACTION_MODE) {
            return match mode.to_ascii_lowercase().as_str() {
                "full" => Ok(Self::Full),
                "batch" => Ok(Self::Batch),
                "incremental" => Ok(Self::Incremental),
                "incremental_batch" => Ok(Self::IncrementalBatch),
                other => Err(ValidationError::invalid(
                    keys::EXTRACTION_MODE,
                    format!("unknown extraction mode '{other}'"),
                )),
            };
        }

        let incremental = params.contains(keys::INCREMENTAL_COLUMN);
        let batched = params.contains(keys::BATCH_SIZE) || params.contains(keys::MAX_BATCHES);
        Ok(match (incremental, batched) {
            (true, true) => Self::IncrementalBatch,
            (true, false) => Self::Incremental,
            (false, true) => Self::Batch,
            (false, false) => Self::Full,
        })
    }

    const fn is_incremental(self) -> bool {
        matches!(self, Self::Incremental | Self::IncrementalBatch)
    }

    const fn is_batched(self) -> bool {
        matches!(self, Self::Batch | Self::IncrementalBatch)
    }
}

impl fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for one orchestrated extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMetadata {
    /// Unique id of the run.
    pub extraction_id: Uuid,
    /// Source identifier.
    pub source_id: String,
    /// Strategy that ran.
    pub strategy: ExtractionStrategy,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run finished.
    pub completed_at: Timestamp,
    /// Wall time of the run.
    pub duration_seconds: f64,
    /// Rows returned.
    pub record_count: u64,
    /// Batch summary, for batched strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchMetadata>,
    /// Watermark summary, for incremental strategies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental: Option<IncrementalMetadata>,
}

/// Rows and metadata of one orchestrated extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionResult {
    /// Extracted rows.
    pub dataset: Dataset,
    /// Run metadata.
    pub metadata: ExtractionMetadata,
}

/// Running totals across orchestrated extractions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Extractions attempted.
    pub total_extractions: u64,
    /// Extractions that returned rows or an empty result.
    pub successful_extractions: u64,
    /// Extractions that returned an error.
    pub failed_extractions: u64,
    /// Rows returned across successful extractions.
    pub total_records: u64,
    /// Successful extractions per strategy.
    pub by_strategy: BTreeMap<ExtractionStrategy, u64>,
    /// Statistics of the latest batched run.
    pub last_batch_run: BatchStats,
}

#[derive(Debug, Default)]
struct Totals {
    total: u64,
    succeeded: u64,
    failed: u64,
    records: u64,
    by_strategy: BTreeMap<ExtractionStrategy, u64>,
}

type StrategyOutput = (Dataset, Option<BatchMetadata>, Option<IncrementalMetadata>);

/// Entry point for extractions against a connector.
pub struct ExtractionOrchestrator {
    config: ExtractorConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    batches: BatchExtractor,
    tracker: IncrementalTracker,
    clock: Arc<dyn Clock>,
    totals: Mutex<Totals>,
}

impl fmt::Debug for ExtractionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionOrchestrator")
            .field("config", &self.config)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl ExtractionOrchestrator {
    /// Creates an orchestrator on the system clock.
    #[must_use]
    pub fn new(config: ExtractorConfig, store: Arc<dyn StateStore>) -> Self {
        Self::with_clock(config, store, system_clock())
    }

    /// Creates an orchestrator on the given clock.
    #[must_use]
    pub fn with_clock(config: ExtractorConfig, store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        let breakers = Arc::new(CircuitBreakerRegistry::with_clock(
            config.circuit_breaker.clone(),
            Arc::clone(&clock),
        ));
        let batches = BatchExtractor::with_clock(
            config.batch.clone(),
            config.retry.clone(),
            Arc::clone(&breakers),
            Arc::clone(&clock),
        );
        let tracker = IncrementalTracker::with_clock(
            store,
            config.incremental.clone(),
            config.retry.clone(),
            Arc::clone(&breakers),
            Arc::clone(&clock),
        );
        Self {
            config,
            breakers,
            batches,
            tracker,
            clock,
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Returns the shared breaker registry.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Returns the batch extractor.
    #[must_use]
    pub fn batch_extractor(&self) -> &BatchExtractor {
        &self.batches
    }

    /// Returns the incremental tracker.
    #[must_use]
    pub fn tracker(&self) -> &IncrementalTracker {
        &self.tracker
    }

    /// Runs one extraction with the strategy `params` select.
    ///
    /// Params are validated before the connector is touched. The connector
    /// is disconnected afterwards whether or not the strategy succeeded.
    pub async fn extract(&self, params: &ExtractionParams, connector: &dyn Connector) -> Result<ExtractionResult> {
        let strategy = ExtractionStrategy::select(params)?;
        if strategy.is_incremental() {
            IncrementalOptions::resolve(self.tracker.config(), params, connector)?;
        }
        if strategy.is_batched() {
            BatchOptions::resolve(&self.config.batch, params, connector)?;
        }

        let source_id = params
            .get_str(keys::SOURCE_ID)
            .unwrap_or_else(|| connector.source_id())
            .to_string();
        let extraction_id = Uuid::now_v7();
        let started = Instant::now();
        let started_at = self.clock.now();
        self.totals.lock().total += 1;

        tracing::info!(
            extraction_id = %extraction_id,
            source_id = %source_id,
            strategy = %strategy,
            "Starting extraction"
        );

        let outcome = match self.connect(connector, &source_id).await {
            Ok(()) => {
                let outcome = self.run_strategy(strategy, params, connector, &source_id).await;
                Self::disconnect(connector, &source_id).await;
                outcome
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok((dataset, batch, incremental)) => {
                let record_count = dataset.len() as u64;
                let duration_seconds = started.elapsed().as_secs_f64();
                {
                    let mut totals = self.totals.lock();
                    totals.succeeded += 1;
                    totals.records = totals.records.saturating_add(record_count);
                    *totals.by_strategy.entry(strategy).or_default() += 1;
                }
                tracing::info!(
                    extraction_id = %extraction_id,
                    source_id = %source_id,
                    strategy = %strategy,
                    records = record_count,
                    duration_seconds,
                    "Extraction completed"
                );
                Ok(ExtractionResult {
                    dataset,
                    metadata: ExtractionMetadata {
                        extraction_id,
                        source_id,
                        strategy,
                        started_at,
                        completed_at: self.clock.now(),
                        duration_seconds,
                        record_count,
                        batch,
                        incremental,
                    },
                })
            }
            Err(err) => {
                self.totals.lock().failed += 1;
                tracing::error!(
                    extraction_id = %extraction_id,
                    source_id = %source_id,
                    strategy = %strategy,
                    error = %err,
                    "Extraction failed"
                );
                Err(err)
            }
        }
    }

    async fn run_strategy(
        &self,
        strategy: ExtractionStrategy,
        params: &ExtractionParams,
        connector: &dyn Connector,
        source_id: &str,
    ) -> Result<StrategyOutput> {
        match strategy {
            ExtractionStrategy::Full => {
                let dataset = self
                    .executor(source_id)
                    .execute("extract", || async {
                        connector.extract(params).await.map_err(ExtractionError::from)
                    })
                    .await?;
                Ok((dataset, None, None))
            }
            ExtractionStrategy::Batch => {
                let params = Self::with_estimate(params, connector, source_id).await;
                let (dataset, batch) = self.batches.extract_in_batches(&params, connector).await?;
                Ok((dataset, Some(batch), None))
            }
            ExtractionStrategy::Incremental => {
                let (dataset, incremental) = self.tracker.extract_incremental(params, connector).await?;
                Ok((dataset, None, Some(incremental)))
            }
            ExtractionStrategy::IncrementalBatch => {
                let window = self.tracker.prepare_window(params, connector).await?;
                let request = params.merged(&window.range_params);
                let (dataset, batch) = self.batches.extract_in_batches(&request, connector).await?;
                // Only a fully drained window may move the watermark.
                let incremental = if batch.stop_reason == StopReason::EndOfData {
                    self.tracker.commit_window(window, &dataset).await
                } else {
                    IncrementalTracker::hold_window(window, &dataset, batch.stop_reason.as_str())
                };
                Ok((dataset, Some(batch), Some(incremental)))
            }
        }
    }

    async fn with_estimate(
        params: &ExtractionParams,
        connector: &dyn Connector,
        source_id: &str,
    ) -> ExtractionParams {
        let mut params = params.clone();
        if params.contains(keys::ESTIMATED_TOTAL_RECORDS) {
            return params;
        }
        match connector.estimate_record_count(&params).await {
            Ok(Some(estimate)) => {
                tracing::debug!(source_id, estimate, "Using connector record estimate");
                params.insert(keys::ESTIMATED_TOTAL_RECORDS, estimate);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(source_id, error = %err, "Record count estimate failed; batching without it");
            }
        }
        params
    }

    async fn connect(&self, connector: &dyn Connector, source_id: &str) -> Result<()> {
        self.executor(source_id)
            .execute("connect", || async {
                match connector.connect().await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(ConnectorError::connection(source_id, "connector refused the session")),
                    Err(err) => Err(err),
                }
                .map_err(ExtractionError::from)
            })
            .await
    }

    async fn disconnect(connector: &dyn Connector, source_id: &str) {
        match connector.disconnect().await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(source_id, "Connector reported an unclean disconnect"),
            Err(err) => tracing::warn!(source_id, error = %err, "Failed to disconnect connector"),
        }
    }

    /// Describes `object_name` through the source's breaker.
    pub async fn get_source_schema(&self, connector: &dyn Connector, object_name: &str) -> Result<SourceSchema> {
        self.executor(connector.source_id())
            .execute("get_source_schema", || async {
                connector
                    .get_source_schema(object_name)
                    .await
                    .map_err(ExtractionError::from)
            })
            .await
    }

    /// Returns running totals and the statistics of the latest batched run.
    #[must_use]
    pub fn extraction_stats(&self) -> ExtractionStats {
        let totals = self.totals.lock();
        ExtractionStats {
            total_extractions: totals.total,
            successful_extractions: totals.succeeded,
            failed_extractions: totals.failed,
            total_records: totals.records,
            by_strategy: totals.by_strategy.clone(),
            last_batch_run: self.batches.stats(),
        }
    }

    /// Returns every breaker's state, sorted by name.
    #[must_use]
    pub fn circuit_breaker_status(&self) -> Vec<CircuitBreakerState> {
        self.breakers.snapshot()
    }

    /// Deletes the stored watermark for `identity`.
    pub async fn reset_extraction_state(&self, identity: &ExtractionIdentity) -> bool {
        self.tracker.reset_extraction_state(identity).await
    }

    fn executor(&self, source_id: &str) -> RetryExecutor {
        RetryExecutor::new(
            self.config.retry.clone(),
            self.breakers.get_or_create(&extract_breaker_name(source_id)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Classify, ErrorKind};
    use crate::extraction::ports::{InMemoryStateStore, SourceType};
    use crate::resilience::CircuitBreakerConfig;
    use crate::testing::{
        fast_retry, manual_clock, numbered_rows, reference_time, timestamped_rows, PagedConnector,
        ScriptedConnector,
    };
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn orchestrator() -> ExtractionOrchestrator {
        let config = ExtractorConfig::new().with_retry(fast_retry());
        ExtractionOrchestrator::with_clock(config, Arc::new(InMemoryStateStore::new()), manual_clock())
    }

    #[test]
    fn test_strategy_selection() {
        let select = |p: ExtractionParams| ExtractionStrategy::select(&p).unwrap();
        assert_eq!(select(ExtractionParams::new()), ExtractionStrategy::Full);
        assert_eq!(select(ExtractionParams::new().with("batch_size", 10)), ExtractionStrategy::Batch);
        assert_eq!(select(ExtractionParams::new().with("max_batches", 2)), ExtractionStrategy::Batch);
        assert_eq!(
            select(ExtractionParams::new().with("incremental_column", "id")),
            ExtractionStrategy::Incremental
        );
        assert_eq!(
            select(ExtractionParams::new().with("incremental_column", "id").with("batch_size", 5)),
            ExtractionStrategy::IncrementalBatch
        );
        assert_eq!(
            select(ExtractionParams::new().with("batch_size", 5).with("extraction_mode", "FULL")),
            ExtractionStrategy::Full
        );
        assert!(ExtractionStrategy::select(&ExtractionParams::new().with("extraction_mode", "cdc")).is_err());
    }

    #[tokio::test]
    async fn test_full_extraction_opens_and_closes_session() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(7));

        let result = assert_ok!(orchestrator.extract(&ExtractionParams::new(), &connector).await);
        assert_eq!(result.dataset.len(), 7);
        assert_eq!(result.metadata.strategy, ExtractionStrategy::Full);
        assert_eq!(result.metadata.record_count, 7);
        assert_eq!(result.metadata.started_at, reference_time());
        assert!(result.metadata.batch.is_none());
        assert_eq!(connector.session_counts(), (1, 1));
        assert_eq!(connector.call_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_strategy_uses_connector_estimate() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(250))
            .with_source_type(SourceType::Relational)
            .with_estimate(200);

        let params = ExtractionParams::new().with("batch_size", 100);
        let result = assert_ok!(orchestrator.extract(&params, &connector).await);

        let batch = result.metadata.batch.unwrap();
        assert_eq!(batch.total_records, 200);
        assert_eq!(batch.stop_reason, crate::extraction::StopReason::EstimateReached);
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test]
    async fn test_incremental_batch_commits_after_all_batches() {
        let orchestrator = orchestrator();
        let t = reference_time();
        let times: Vec<_> = (1..=5).map(|h| t + ChronoDuration::minutes(h)).collect();
        let connector = PagedConnector::new("pg", timestamped_rows(&times));

        let params = ExtractionParams::new()
            .with("table_name", "orders")
            .with("incremental_column", "updated_at")
            .with("batch_size", 2);
        let result = assert_ok!(orchestrator.extract(&params, &connector).await);

        assert_eq!(result.metadata.strategy, ExtractionStrategy::IncrementalBatch);
        assert_eq!(result.dataset.len(), 5);
        assert_eq!(result.metadata.batch.as_ref().unwrap().total_batches, 3);
        let incremental = result.metadata.incremental.unwrap();
        assert!(incremental.state_updated);
        assert_eq!(incremental.new_watermark, Some(json!(crate::utils::format_iso8601(&times[4]))));

        for sent in connector.recorded_params() {
            assert!(sent.contains("from_timestamp"));
            assert!(sent.contains("offset"));
        }
    }

    #[tokio::test]
    async fn test_validation_happens_before_connect() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(1));

        let params = ExtractionParams::new().with("extraction_mode", "incremental");
        let err = assert_err!(orchestrator.extract(&params, &connector).await);
        assert_eq!(err.kind(), ErrorKind::Validation);

        let params = ExtractionParams::new().with("batch_size", 0);
        let err = assert_err!(orchestrator.extract(&params, &connector).await);
        assert_eq!(err.kind(), ErrorKind::Validation);

        assert_eq!(connector.session_counts(), (0, 0));
        assert_eq!(orchestrator.extraction_stats().total_extractions, 0);
    }

    #[tokio::test]
    async fn test_connect_retries_then_fails() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(1)).with_connect_failures([
            ConnectorError::connection("pg", "refused"),
            ConnectorError::connection("pg", "refused"),
            ConnectorError::connection("pg", "refused"),
        ]);

        let err = assert_err!(orchestrator.extract(&ExtractionParams::new(), &connector).await);
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(connector.session_counts(), (3, 0));
        assert_eq!(connector.call_count(), 0);

        let stats = orchestrator.extraction_stats();
        assert_eq!(stats.total_extractions, 1);
        assert_eq!(stats.failed_extractions, 1);
    }

    #[tokio::test]
    async fn test_disconnects_after_failed_strategy() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(3))
            .with_transient_failures([ConnectorError::extraction("bad query")]);
        let err = assert_err!(orchestrator.extract(&ExtractionParams::new(), &connector).await);
        assert_eq!(err.kind(), ErrorKind::Extraction);
        assert_eq!(connector.call_count(), 1);
        assert_eq!(connector.session_counts(), (1, 1));
    }

    #[tokio::test]
    async fn test_stats_and_breaker_status() {
        let config = ExtractorConfig::new()
            .with_retry(fast_retry())
            .with_circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(1));
        let orchestrator =
            ExtractionOrchestrator::with_clock(config, Arc::new(InMemoryStateStore::new()), manual_clock());

        let good = PagedConnector::new("good", numbered_rows(3));
        assert_ok!(orchestrator.extract(&ExtractionParams::new(), &good).await);
        assert_ok!(orchestrator.extract(&ExtractionParams::new().with("batch_size", 2), &good).await);

        let bad = ScriptedConnector::new("bad").then_fail(ConnectorError::extraction("boom"));
        assert_err!(orchestrator.extract(&ExtractionParams::new(), &bad).await);

        let stats = orchestrator.extraction_stats();
        assert_eq!(stats.total_extractions, 3);
        assert_eq!(stats.successful_extractions, 2);
        assert_eq!(stats.failed_extractions, 1);
        assert_eq!(stats.total_records, 6);
        assert_eq!(stats.by_strategy.get(&ExtractionStrategy::Batch), Some(&1));
        assert_eq!(stats.last_batch_run.total_batches, 3);

        let status = orchestrator.circuit_breaker_status();
        let names: Vec<_> = status.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["extract:bad", "extract:good"]);
        assert!(status[0].is_open);
        assert!(!status[1].is_open);
    }

    #[tokio::test]
    async fn test_schema_lookup_goes_through_executor() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", numbered_rows(1));
        let schema = assert_ok!(orchestrator.get_source_schema(&connector, "items").await);
        assert_eq!(schema.object_name, "items");
        assert!(schema.field("name").is_some());

        let scripted = ScriptedConnector::new("api");
        let err = assert_err!(orchestrator.get_source_schema(&scripted, "items").await);
        assert_eq!(err.kind(), ErrorKind::Schema);
    }

    #[tokio::test]
    async fn test_reset_extraction_state() {
        let orchestrator = orchestrator();
        let connector = PagedConnector::new("pg", timestamped_rows(&[reference_time()]));
        let params = ExtractionParams::new()
            .with("table_name", "orders")
            .with("incremental_column", "updated_at");

        let first = assert_ok!(orchestrator.extract(&params, &connector).await);
        assert!(first.metadata.incremental.unwrap().first_run);
        let second = assert_ok!(orchestrator.extract(&params, &connector).await);
        assert!(!second.metadata.incremental.unwrap().first_run);

        let identity = ExtractionIdentity::new("pg", "orders", "updated_at").unwrap();
        assert!(orchestrator.reset_extraction_state(&identity).await);
        let third = assert_ok!(orchestrator.extract(&params, &connector).await);
        assert!(third.metadata.incremental.unwrap().first_run);
    }
}
