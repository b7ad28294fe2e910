//! Configuration for the extraction components.
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration. Per-call extraction parameters override the values they
//! name.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::errors::{ExtractionError, Result};
use crate::extraction::BatchSizeBounds;
use crate::resilience::{CircuitBreakerConfig, RetryConfig};

/// Batch planning defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Batch size when nothing else decides.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: u64,
    /// Lower clamp for computed sizes.
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: u64,
    /// Upper clamp for computed sizes.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    /// Upper bound on batches per run.
    #[serde(default)]
    pub max_batches: Option<u64>,
    /// Wall-clock budget per run, in seconds.
    #[serde(default = "default_batch_timeout_seconds")]
    pub batch_timeout_seconds: f64,
    /// Whether metadata lists every batch outcome.
    #[serde(default)]
    pub include_batch_details: bool,
}

fn default_batch_size() -> u64 {
    10_000
}

fn default_min_batch_size() -> u64 {
    100
}

fn default_max_batch_size() -> u64 {
    100_000
}

fn default_batch_timeout_seconds() -> f64 {
    3600.0
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            max_batches: None,
            batch_timeout_seconds: default_batch_timeout_seconds(),
            include_batch_details: false,
        }
    }
}

impl BatchConfig {
    /// Sets the default batch size.
    #[must_use]
    pub fn with_default_batch_size(mut self, size: u64) -> Self {
        self.default_batch_size = size;
        self
    }

    /// Sets the maximum number of batches.
    #[must_use]
    pub fn with_max_batches(mut self, max: u64) -> Self {
        self.max_batches = Some(max);
        self
    }

    /// Sets the run timeout.
    #[must_use]
    pub fn with_batch_timeout_seconds(mut self, seconds: f64) -> Self {
        self.batch_timeout_seconds = seconds;
        self
    }
}

/// Incremental tracking defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Collection holding watermark documents.
    #[serde(default = "default_state_collection")]
    pub state_collection: String,
    /// First-run lookback for timestamp columns, in hours.
    #[serde(default = "default_lookback_window_hours")]
    pub lookback_window_hours: f64,
    /// Overlap subtracted from the next timestamp lower bound, in seconds.
    #[serde(default = "default_watermark_buffer_seconds")]
    pub watermark_buffer_seconds: f64,
    /// History entries kept per document.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_state_collection() -> String {
    "incremental_extraction_state".to_string()
}

fn default_lookback_window_hours() -> f64 {
    24.0
}

fn default_watermark_buffer_seconds() -> f64 {
    60.0
}

fn default_history_limit() -> usize {
    10
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            state_collection: default_state_collection(),
            lookback_window_hours: default_lookback_window_hours(),
            watermark_buffer_seconds: default_watermark_buffer_seconds(),
            history_limit: default_history_limit(),
        }
    }
}

impl IncrementalConfig {
    /// Sets the state collection.
    #[must_use]
    pub fn with_state_collection(mut self, collection: impl Into<String>) -> Self {
        self.state_collection = collection.into();
        self
    }

    /// Sets the watermark buffer.
    #[must_use]
    pub fn with_watermark_buffer_seconds(mut self, seconds: f64) -> Self {
        self.watermark_buffer_seconds = seconds;
        self
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Batch planning.
    #[serde(default)]
    pub batch: BatchConfig,
    /// Incremental tracking.
    #[serde(default)]
    pub incremental: IncrementalConfig,
    /// Retry policy for connector and state store calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Breaker thresholds.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExtractorConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ExtractionError::Configuration(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded extractor configuration");
        Self::from_json_str(&raw)
    }

    /// Sets the batch section.
    #[must_use]
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Sets the incremental section.
    #[must_use]
    pub fn with_incremental(mut self, incremental: IncrementalConfig) -> Self {
        self.incremental = incremental;
        self
    }

    /// Sets the retry section.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the breaker section.
    #[must_use]
    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        BatchSizeBounds::new(self.batch.min_batch_size, self.batch.max_batch_size)?;
        if self.batch.default_batch_size == 0 {
            return Err(config_error("batch.default_batch_size must be positive"));
        }
        if !(self.batch.batch_timeout_seconds.is_finite() && self.batch.batch_timeout_seconds > 0.0) {
            return Err(config_error("batch.batch_timeout_seconds must be positive"));
        }
        if self.incremental.state_collection.trim().is_empty() {
            return Err(config_error("incremental.state_collection must not be empty"));
        }
        if !(self.incremental.lookback_window_hours.is_finite()
            && self.incremental.lookback_window_hours >= 0.0)
        {
            return Err(config_error("incremental.lookback_window_hours must be non-negative"));
        }
        if !(self.incremental.watermark_buffer_seconds.is_finite()
            && self.incremental.watermark_buffer_seconds >= 0.0)
        {
            return Err(config_error("incremental.watermark_buffer_seconds must be non-negative"));
        }
        if self.incremental.history_limit == 0 {
            return Err(config_error("incremental.history_limit must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(config_error("retry.max_attempts must be at least 1"));
        }
        if !(self.retry.backoff_factor.is_finite() && self.retry.backoff_factor >= 1.0) {
            return Err(config_error("retry.backoff_factor must be at least 1.0"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(config_error("circuit_breaker.failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> ExtractionError {
    ExtractionError::Configuration(message.to_string())
}

/// Converts fractional seconds to a [`Duration`], reading invalid values as zero.
#[must_use]
pub fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
