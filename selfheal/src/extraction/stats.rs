//! Per-run batch statistics.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

use crate::utils::Timestamp;

/// Number of recent batch outcomes kept.
pub const BATCH_HISTORY_LIMIT: usize = 10;

/// Problems recording a batch outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    /// A counter would overflow; it was saturated instead.
    #[error("batch counter '{0}' overflowed")]
    Overflow(&'static str),

    /// The measured processing time is not a finite, non-negative number.
    #[error("invalid batch processing time: {0}")]
    InvalidDuration(f64),
}

/// Outcome of one batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    /// 1-based batch number.
    pub batch_number: u64,
    /// Whether the batch succeeded.
    pub success: bool,
    /// Rows returned.
    pub record_count: u64,
    /// Wall time spent on the batch, including retries.
    pub processing_time_seconds: f64,
    /// When the batch finished.
    pub timestamp: Timestamp,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate statistics for the current batched extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Batches attempted.
    pub total_batches: u64,
    /// Batches that returned data or an empty page.
    pub successful_batches: u64,
    /// Batches that failed after retries.
    pub failed_batches: u64,
    /// Rows returned by successful batches.
    pub total_records: u64,
    /// Sum of batch processing times.
    pub total_processing_time_seconds: f64,
    /// Most recent outcomes, oldest first.
    pub batch_history: VecDeque<BatchOutcome>,
}

impl BatchStats {
    /// Clears every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records one outcome.
    ///
    /// The attempt is always counted and kept in the history. An error means
    /// one of the aggregates could not be updated exactly.
    pub fn record(&mut self, outcome: BatchOutcome) -> Result<(), StatsError> {
        let mut result = Ok(());

        self.total_batches = self.total_batches.saturating_add(1);
        let (counter, name) = if outcome.success {
            (&mut self.successful_batches, "successful_batches")
        } else {
            (&mut self.failed_batches, "failed_batches")
        };
        *counter = counter.checked_add(1).unwrap_or_else(|| {
            result = Err(StatsError::Overflow(name));
            u64::MAX
        });

        if outcome.success {
            match self.total_records.checked_add(outcome.record_count) {
                Some(total) => self.total_records = total,
                None => {
                    self.total_records = u64::MAX;
                    result = Err(StatsError::Overflow("total_records"));
                }
            }
        }

        let seconds = outcome.processing_time_seconds;
        if seconds.is_finite() && seconds >= 0.0 {
            self.total_processing_time_seconds += seconds;
        } else {
            result = Err(StatsError::InvalidDuration(seconds));
        }

        self.batch_history.push_back(outcome);
        while self.batch_history.len() > BATCH_HISTORY_LIMIT {
            self.batch_history.pop_front();
        }

        result
    }

    /// Returns the fraction of attempted batches that succeeded.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_batches == 0 {
            0.0
        } else {
            self.successful_batches as f64 / self.total_batches as f64
        }
    }
}
