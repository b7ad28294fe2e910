//! Batched extraction.
//!
//! Large extractions are split into sequential `offset`/`batch_size`
//! requests. Each request goes through the retry executor guarded by the
//! source's breaker; the loop stops on an empty page, a batch cap, a
//! consumed estimate or the run timeout, whichever comes first.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::ports::{Connector, SourceType};
use super::sizing::{calculate_optimal_batch_size, BatchSizeBounds, BatchSizingInput};
use super::stats::{BatchOutcome, BatchStats};
use crate::config::{seconds, BatchConfig};
use crate::core::{keys, Dataset, ExtractionParams};
use crate::errors::{ExtractionError, Result, ValidationError};
use crate::resilience::{extract_breaker_name, CircuitBreakerRegistry, RetryConfig, RetryExecutor};
use crate::utils::{format_iso8601, system_clock, Clock};

/// Why a batch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A batch came back empty.
    EndOfData,
    /// `max_batches` requests were issued.
    MaxBatches,
    /// `estimated_total_records` rows were read.
    EstimateReached,
    /// The run exceeded `batch_timeout_seconds`.
    Timeout,
}

impl StopReason {
    /// Returns the serialized name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndOfData => "end_of_data",
            Self::MaxBatches => "max_batches",
            Self::EstimateReached => "estimate_reached",
            Self::Timeout => "timeout",
        }
    }
}

/// Options for one batched run, after params have been layered over config.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    /// Source identifier.
    pub source_id: String,
    /// Rows requested per batch.
    pub batch_size: u64,
    /// Upper bound on requests.
    pub max_batches: Option<u64>,
    /// Expected number of rows.
    pub estimated_total_records: Option<u64>,
    /// Wall-clock budget.
    pub timeout: Duration,
    /// Whether metadata lists every batch outcome.
    pub include_batch_details: bool,
}

impl BatchOptions {
    /// Resolves options for `connector` from `config` and per-call `params`.
    ///
    /// An explicit `batch_size` wins; otherwise the size is computed from
    /// the source type, estimate and memory budget.
    pub fn resolve(
        config: &BatchConfig,
        params: &ExtractionParams,
        connector: &dyn Connector,
    ) -> std::result::Result<Self, ValidationError> {
        let bounds = BatchSizeBounds::new(
            params
                .get_u64(keys::MIN_BATCH_SIZE)?
                .unwrap_or(config.min_batch_size),
            params
                .get_u64(keys::MAX_BATCH_SIZE)?
                .unwrap_or(config.max_batch_size),
        )?;

        let source_type = params
            .get_str(keys::SOURCE_TYPE)
            .map_or_else(|| connector.source_type(), SourceType::parse);
        let estimated_total_records = params.get_u64(keys::ESTIMATED_TOTAL_RECORDS)?;

        let batch_size = match params.get_u64(keys::BATCH_SIZE)? {
            Some(0) => {
                return Err(ValidationError::invalid(keys::BATCH_SIZE, "must be positive"));
            }
            Some(explicit) => explicit,
            None => calculate_optimal_batch_size(
                config.default_batch_size,
                &BatchSizingInput {
                    source_type,
                    estimated_total_records,
                    memory_limit_mb: params.get_f64(keys::MEMORY_LIMIT_MB)?,
                    avg_record_size_bytes: params.get_f64(keys::AVG_RECORD_SIZE_BYTES)?,
                },
                bounds,
            ),
        };

        let max_batches = params.get_u64(keys::MAX_BATCHES)?.or(config.max_batches);
        let timeout = seconds(
            params
                .get_f64(keys::BATCH_TIMEOUT_SECONDS)?
                .unwrap_or(config.batch_timeout_seconds),
        );
        let include_batch_details = params
            .get_bool(keys::INCLUDE_BATCH_DETAILS)?
            .unwrap_or(config.include_batch_details);
        let source_id = params
            .get_str(keys::SOURCE_ID)
            .unwrap_or_else(|| connector.source_id())
            .to_string();

        Ok(Self {
            source_id,
            batch_size,
            max_batches,
            estimated_total_records,
            timeout,
            include_batch_details,
        })
    }
}

/// Summary of a batched run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    /// Source identifier.
    pub source_id: String,
    /// Rows requested per batch.
    pub batch_size: u64,
    /// Batches that returned rows.
    pub total_batches: u64,
    /// Requests issued, including the final empty page.
    pub requests_issued: u64,
    /// Rows in the combined dataset.
    pub total_records: u64,
    /// Wall time of the whole run.
    pub total_time_seconds: f64,
    /// Throughput over the whole run.
    pub records_per_second: f64,
    /// Mean rows per data-bearing batch.
    pub avg_batch_size: f64,
    /// Mean time per request.
    pub avg_batch_time_seconds: f64,
    /// Why the loop ended.
    pub stop_reason: StopReason,
    /// Batches left out of the combined dataset because they were malformed.
    pub excluded_batches: Vec<u64>,
    /// Every batch outcome, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_details: Option<Vec<BatchOutcome>>,
}

/// Runs batched extractions and keeps statistics for the latest one.
#[derive(Debug)]
pub struct BatchExtractor {
    config: BatchConfig,
    retry: RetryConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    clock: Arc<dyn Clock>,
    stats: Mutex<BatchStats>,
    suppressed: Mutex<Vec<String>>,
}

impl BatchExtractor {
    /// Creates an extractor on the system clock.
    #[must_use]
    pub fn new(config: BatchConfig, retry: RetryConfig, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self::with_clock(config, retry, breakers, system_clock())
    }

    /// Creates an extractor on the given clock.
    #[must_use]
    pub fn with_clock(
        config: BatchConfig,
        retry: RetryConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            retry,
            breakers,
            clock,
            stats: Mutex::new(BatchStats::default()),
            suppressed: Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of the statistics for the latest run.
    #[must_use]
    pub fn stats(&self) -> BatchStats {
        self.stats.lock().clone()
    }

    /// Returns statistics errors from the latest run that were logged
    /// instead of failing it.
    #[must_use]
    pub fn suppressed_errors(&self) -> Vec<String> {
        self.suppressed.lock().clone()
    }

    /// Extracts all rows in sequential batches.
    ///
    /// Validation happens before any connector call. A batch that still
    /// fails after retries fails the whole run; the statistics keep the
    /// batches completed before it.
    pub async fn extract_in_batches(
        &self,
        params: &ExtractionParams,
        connector: &dyn Connector,
    ) -> Result<(Dataset, BatchMetadata)> {
        self.stats.lock().reset();
        self.suppressed.lock().clear();
        let options = BatchOptions::resolve(&self.config, params, connector)?;

        let breaker = self.breakers.get_or_create(&extract_breaker_name(&options.source_id));
        let executor = RetryExecutor::new(self.retry.clone(), breaker);

        let run_started = Instant::now();
        let run_started_at = self.clock.now();
        tracing::info!(
            source_id = %options.source_id,
            batch_size = options.batch_size,
            max_batches = ?options.max_batches,
            estimated_total_records = ?options.estimated_total_records,
            "Starting batched extraction"
        );

        let mut parts = Vec::new();
        let mut part_numbers = Vec::new();
        let mut details = Vec::new();
        let mut offset: u64 = 0;
        let mut requests: u64 = 0;
        let mut rows_read: u64 = 0;
        let mut request_time = 0.0_f64;
        let mut last_len: Option<u64> = None;

        let stop_reason = loop {
            if last_len == Some(0) {
                break StopReason::EndOfData;
            }
            if options.max_batches.is_some_and(|max| requests >= max) {
                break StopReason::MaxBatches;
            }
            if options.estimated_total_records.is_some_and(|est| rows_read >= est) {
                break StopReason::EstimateReached;
            }
            if run_started.elapsed() > options.timeout {
                tracing::warn!(
                    source_id = %options.source_id,
                    batches = requests,
                    timeout_seconds = options.timeout.as_secs_f64(),
                    "Batch extraction timed out"
                );
                break StopReason::Timeout;
            }

            requests += 1;
            let batch_number = requests;
            let batch_started = Instant::now();
            let batch_params = params.merged(
                &ExtractionParams::new()
                    .with(keys::BATCH_NUMBER, batch_number)
                    .with(keys::BATCH_SIZE, options.batch_size)
                    .with(keys::OFFSET, offset)
                    .with(
                        keys::BATCH_CONTEXT,
                        json!({
                            "source_id": options.source_id,
                            "extraction_start": format_iso8601(&run_started_at),
                            "batch_start": format_iso8601(&self.clock.now()),
                            "elapsed_seconds": run_started.elapsed().as_secs_f64(),
                        }),
                    ),
            );

            let result = executor
                .execute("extract_batch", || async {
                    connector
                        .extract(&batch_params)
                        .await
                        .map_err(ExtractionError::from)
                })
                .await;
            let elapsed = batch_started.elapsed().as_secs_f64();
            request_time += elapsed;

            match result {
                Ok(dataset) => {
                    let len = dataset.len() as u64;
                    tracing::debug!(
                        source_id = %options.source_id,
                        batch_number,
                        offset,
                        records = len,
                        elapsed_seconds = elapsed,
                        "Batch extracted"
                    );
                    self.record(
                        BatchOutcome {
                            batch_number,
                            success: true,
                            record_count: len,
                            processing_time_seconds: elapsed,
                            timestamp: self.clock.now(),
                            error: None,
                        },
                        options.include_batch_details.then_some(&mut details),
                    );
                    offset = offset.saturating_add(len);
                    rows_read = rows_read.saturating_add(len);
                    last_len = Some(len);
                    if len > 0 {
                        parts.push(dataset);
                        part_numbers.push(batch_number);
                    }
                }
                Err(err) => {
                    tracing::error!(
                        source_id = %options.source_id,
                        batch_number,
                        offset,
                        error = %err,
                        "Batch failed"
                    );
                    self.record(
                        BatchOutcome {
                            batch_number,
                            success: false,
                            record_count: 0,
                            processing_time_seconds: elapsed,
                            timestamp: self.clock.now(),
                            error: Some(err.to_string()),
                        },
                        None,
                    );
                    return Err(err);
                }
            }
        };

        let combined = Dataset::concat(parts);
        let mut excluded_batches = Vec::with_capacity(combined.excluded.len());
        for (idx, reason) in &combined.excluded {
            let batch_number = part_numbers.get(*idx).copied().unwrap_or_default();
            tracing::warn!(
                source_id = %options.source_id,
                batch_number,
                reason = %reason,
                "Excluding malformed batch from combined dataset"
            );
            excluded_batches.push(batch_number);
        }
        let dataset = combined.dataset;

        let total_time = run_started.elapsed().as_secs_f64();
        let total_records = dataset.len() as u64;
        let data_batches = part_numbers.len() as u64;
        let metadata = BatchMetadata {
            source_id: options.source_id.clone(),
            batch_size: options.batch_size,
            total_batches: data_batches,
            requests_issued: requests,
            total_records,
            total_time_seconds: total_time,
            records_per_second: ratio(total_records as f64, total_time),
            avg_batch_size: ratio(rows_read as f64, data_batches as f64),
            avg_batch_time_seconds: ratio(request_time, requests as f64),
            stop_reason,
            excluded_batches,
            batch_details: options.include_batch_details.then_some(details),
        };

        tracing::info!(
            source_id = %metadata.source_id,
            total_batches = metadata.total_batches,
            total_records = metadata.total_records,
            stop_reason = ?metadata.stop_reason,
            total_time_seconds = metadata.total_time_seconds,
            "Batched extraction complete"
        );

        Ok((dataset, metadata))
    }

    fn record(&self, outcome: BatchOutcome, details: Option<&mut Vec<BatchOutcome>>) {
        if let Some(details) = details {
            details.push(outcome.clone());
        }
        if let Err(err) = self.stats.lock().record(outcome) {
            tracing::warn!(error = %err, "Failed to record batch statistics");
            self.suppressed.lock().push(err.to_string());
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Classify, ConnectorError, ErrorKind};
    use crate::resilience::CircuitBreakerConfig;
    use crate::testing::{fast_retry, numbered_rows, reference_time, PagedConnector, ScriptedConnector};
    use pretty_assertions::assert_eq;

    fn extractor(config: BatchConfig) -> BatchExtractor {
        BatchExtractor::new(config, fast_retry(), Arc::new(CircuitBreakerRegistry::default()))
    }

    #[tokio::test]
    async fn test_pages_until_empty_batch() {
        let connector = PagedConnector::new("pg", numbered_rows(1000));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new().with("batch_size", 200);

        let (dataset, metadata) = extractor.extract_in_batches(&params, &connector).await.unwrap();

        assert_eq!(dataset.len(), 1000);
        assert_eq!(connector.call_count(), 6);
        assert_eq!(metadata.total_batches, 5);
        assert_eq!(metadata.requests_issued, 6);
        assert_eq!(metadata.total_records, 1000);
        assert_eq!(metadata.stop_reason, StopReason::EndOfData);
        assert_eq!(metadata.avg_batch_size, 200.0);

        let offsets: Vec<_> = connector
            .recorded_params()
            .iter()
            .map(|p| p.get_u64("offset").unwrap().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 200, 400, 600, 800, 1000]);
    }

    #[tokio::test]
    async fn test_batch_params_carry_context_and_caller_options() {
        let connector = PagedConnector::new("pg", numbered_rows(3));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new()
            .with("batch_size", 10)
            .with("query", "select * from orders");

        extractor.extract_in_batches(&params, &connector).await.unwrap();

        let first = &connector.recorded_params()[0];
        assert_eq!(first.get_u64("batch_number").unwrap(), Some(1));
        assert_eq!(first.get_str("query"), Some("select * from orders"));
        let context = first.get("batch_context").unwrap();
        assert_eq!(context["source_id"], "pg");
        assert!(context["extraction_start"].is_string());
        assert!(context["elapsed_seconds"].is_number());
    }

    #[tokio::test]
    async fn test_stops_at_max_batches() {
        let connector = PagedConnector::new("pg", numbered_rows(1000));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new().with("batch_size", 100).with("max_batches", 3);

        let (dataset, metadata) = extractor.extract_in_batches(&params, &connector).await.unwrap();

        assert_eq!(dataset.len(), 300);
        assert_eq!(connector.call_count(), 3);
        assert_eq!(metadata.stop_reason, StopReason::MaxBatches);
    }

    #[tokio::test]
    async fn test_stops_when_estimate_consumed() {
        let connector = PagedConnector::new("pg", numbered_rows(1000));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new()
            .with("batch_size", 250)
            .with("estimated_total_records", 500);

        let (dataset, metadata) = extractor.extract_in_batches(&params, &connector).await.unwrap();

        assert_eq!(dataset.len(), 500);
        assert_eq!(metadata.stop_reason, StopReason::EstimateReached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_timeout() {
        let connector =
            PagedConnector::new("pg", numbered_rows(1000)).with_latency(Duration::from_secs(4));
        let extractor = extractor(BatchConfig::default().with_batch_timeout_seconds(10.0));
        let params = ExtractionParams::new().with("batch_size", 100);

        let (dataset, metadata) = extractor.extract_in_batches(&params, &connector).await.unwrap();

        // Checks at 0s, 4s and 8s pass; the check at 12s stops the loop.
        assert_eq!(connector.call_count(), 3);
        assert_eq!(dataset.len(), 300);
        assert_eq!(metadata.stop_reason, StopReason::Timeout);
    }

    #[tokio::test]
    async fn test_failed_batch_fails_run_and_keeps_stats() {
        let connector = PagedConnector::new("pg", numbered_rows(1000))
            .failing_from_offset(200, ConnectorError::extraction("bad page"));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new().with("batch_size", 100);

        let err = extractor.extract_in_batches(&params, &connector).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Extraction);

        let stats = extractor.stats();
        assert_eq!(stats.total_batches, 3);
        assert_eq!(stats.successful_batches, 2);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.total_records, 200);
        assert!(stats.batch_history.back().unwrap().error.is_some());
    }

    #[tokio::test]
    async fn test_transient_batch_failures_are_retried() {
        let connector = PagedConnector::new("pg", numbered_rows(150)).with_transient_failures([
            ConnectorError::timeout("slow"),
            ConnectorError::ConnectionReset("peer".into()),
        ]);
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new().with("batch_size", 100);

        let (dataset, _) = extractor.extract_in_batches(&params, &connector).await.unwrap();
        assert_eq!(dataset.len(), 150);
        assert_eq!(connector.call_count(), 5);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let registry = Arc::new(CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        ));
        registry.get_or_create("extract:pg").record_failure();
        let extractor = BatchExtractor::new(BatchConfig::default(), fast_retry(), registry);
        let connector = PagedConnector::new("pg", numbered_rows(10));

        let err = extractor
            .extract_in_batches(&ExtractionParams::new(), &connector)
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(connector.call_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_before_any_call() {
        let connector = PagedConnector::new("pg", numbered_rows(10));
        let extractor = extractor(BatchConfig::default());

        for params in [
            ExtractionParams::new().with("min_batch_size", 500).with("max_batch_size", 100),
            ExtractionParams::new().with("batch_size", 0),
            ExtractionParams::new().with("max_batches", "many"),
        ] {
            let err = extractor.extract_in_batches(&params, &connector).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert_eq!(connector.call_count(), 0);
    }

    #[tokio::test]
    async fn test_computed_size_uses_source_type() {
        let connector = PagedConnector::new("api", numbered_rows(12_000))
            .with_source_type(SourceType::Api);
        let extractor = extractor(BatchConfig::default());

        let (dataset, metadata) = extractor
            .extract_in_batches(&ExtractionParams::new(), &connector)
            .await
            .unwrap();
        assert_eq!(metadata.batch_size, 5_000);
        assert_eq!(metadata.total_batches, 3);
        assert_eq!(dataset.len(), 12_000);
    }

    #[tokio::test]
    async fn test_malformed_batch_is_excluded() {
        let ragged = Dataset::from_parts(
            vec!["id".into()],
            vec![vec![serde_json::json!(3), serde_json::json!("extra")]],
        );
        let connector = ScriptedConnector::new("api")
            .then_return(numbered_rows(2))
            .then_return(ragged)
            .then_return(numbered_rows(1));
        let extractor = extractor(BatchConfig::default());

        let (dataset, metadata) = extractor
            .extract_in_batches(&ExtractionParams::new().with("batch_size", 2), &connector)
            .await
            .unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(metadata.excluded_batches, vec![2]);
        assert_eq!(metadata.total_batches, 3);
        assert_eq!(connector.call_count(), 4);
    }

    #[tokio::test]
    async fn test_batch_details_on_request() {
        let connector = PagedConnector::new("pg", numbered_rows(5));
        let extractor = extractor(BatchConfig::default());

        let (_, without) = extractor
            .extract_in_batches(&ExtractionParams::new().with("batch_size", 5), &connector)
            .await
            .unwrap();
        assert!(without.batch_details.is_none());

        let params = ExtractionParams::new()
            .with("batch_size", 5)
            .with("include_batch_details", true);
        let (_, with) = extractor.extract_in_batches(&params, &connector).await.unwrap();
        let details = with.batch_details.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].record_count, 5);
        assert_eq!(details[1].record_count, 0);
    }

    #[tokio::test]
    async fn test_stats_reset_each_run() {
        let connector = PagedConnector::new("pg", numbered_rows(10));
        let extractor = extractor(BatchConfig::default());
        let params = ExtractionParams::new().with("batch_size", 10);

        extractor.extract_in_batches(&params, &connector).await.unwrap();
        extractor.extract_in_batches(&params, &connector).await.unwrap();

        let stats = extractor.stats();
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.total_records, 10);
        assert!(extractor.suppressed_errors().is_empty());
    }

    #[tokio::test]
    async fn test_suppressed_errors_cover_latest_run_only() {
        let connector = PagedConnector::new("pg", numbered_rows(3));
        let extractor = extractor(BatchConfig::default());
        extractor.record(
            BatchOutcome {
                batch_number: 1,
                success: true,
                record_count: 3,
                processing_time_seconds: -1.0,
                timestamp: reference_time(),
                error: None,
            },
            None,
        );
        assert_eq!(extractor.suppressed_errors().len(), 1);

        extractor
            .extract_in_batches(&ExtractionParams::new().with("batch_size", 3), &connector)
            .await
            .unwrap();
        assert!(extractor.suppressed_errors().is_empty());
    }
}
