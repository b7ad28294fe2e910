//! Batch size selection.

use crate::errors::ValidationError;
use crate::extraction::ports::SourceType;

const STORAGE_MIN_BATCH: u64 = 25_000;
const RELATIONAL_MAX_BATCH: u64 = 15_000;
const API_MAX_BATCH: u64 = 5_000;
const LARGE_DATASET_RECORDS: u64 = 1_000_000;
const TARGET_MAX_BATCHES: u64 = 100;
const MEMORY_HEADROOM: f64 = 0.5;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Inclusive clamp for batch sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizeBounds {
    min: u64,
    max: u64,
}

impl BatchSizeBounds {
    /// Creates bounds. Both must be positive and `min <= max`.
    pub fn new(min: u64, max: u64) -> Result<Self, ValidationError> {
        if min == 0 {
            return Err(ValidationError::invalid("min_batch_size", "must be positive"));
        }
        if min > max {
            return Err(ValidationError::invalid(
                "min_batch_size",
                format!("({min}) must not exceed max_batch_size ({max})"),
            ));
        }
        Ok(Self { min, max })
    }

    /// Lower bound.
    #[must_use]
    pub fn min(&self) -> u64 {
        self.min
    }

    /// Upper bound.
    #[must_use]
    pub fn max(&self) -> u64 {
        self.max
    }
}

/// Facts about the extraction that influence batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchSizingInput {
    /// Source family.
    pub source_type: SourceType,
    /// Expected number of rows.
    pub estimated_total_records: Option<u64>,
    /// Memory budget for one batch, in megabytes.
    pub memory_limit_mb: Option<f64>,
    /// Average row size, in bytes.
    pub avg_record_size_bytes: Option<f64>,
}

/// Picks a batch size.
///
/// Starting from `default_size`: storage sources get at least 25 000 rows,
/// relational sources at most 15 000 and APIs at most 5 000. An estimate
/// below half the candidate collapses the run into a single batch; an
/// estimate above one million grows batches so about 100 suffice. A memory
/// budget caps the size at half the budget divided by the row size. The
/// result is clamped to `bounds`.
#[must_use]
pub fn calculate_optimal_batch_size(
    default_size: u64,
    input: &BatchSizingInput,
    bounds: BatchSizeBounds,
) -> u64 {
    let mut candidate = default_size.max(1);

    candidate = match input.source_type {
        SourceType::Storage => candidate.max(STORAGE_MIN_BATCH),
        SourceType::Relational => candidate.min(RELATIONAL_MAX_BATCH),
        SourceType::Api => candidate.min(API_MAX_BATCH),
        SourceType::Unknown => candidate,
    };

    if let Some(estimate) = input.estimated_total_records {
        if estimate < candidate / 2 {
            candidate = estimate;
        } else if estimate > LARGE_DATASET_RECORDS {
            candidate = candidate.max(estimate.div_ceil(TARGET_MAX_BATCHES));
        }
    }

    if let (Some(memory_mb), Some(record_bytes)) = (input.memory_limit_mb, input.avg_record_size_bytes) {
        if memory_mb > 0.0 && record_bytes > 0.0 {
            let cap = (MEMORY_HEADROOM * memory_mb * BYTES_PER_MB / record_bytes).floor();
            if cap.is_finite() {
                candidate = candidate.min((cap as u64).max(1));
            }
        }
    }

    candidate.clamp(bounds.min, bounds.max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bounds() -> BatchSizeBounds {
        BatchSizeBounds::new(100, 100_000).unwrap()
    }

    fn input(source_type: SourceType) -> BatchSizingInput {
        BatchSizingInput {
            source_type,
            ..BatchSizingInput::default()
        }
    }

    #[test]
    fn test_bounds_validation() {
        assert!(BatchSizeBounds::new(500, 100).is_err());
        assert!(BatchSizeBounds::new(0, 100).is_err());
        assert!(BatchSizeBounds::new(100, 100).is_ok());
    }

    #[test]
    fn test_source_type_bias() {
        assert_eq!(calculate_optimal_batch_size(10_000, &input(SourceType::Storage), bounds()), 25_000);
        assert_eq!(calculate_optimal_batch_size(20_000, &input(SourceType::Relational), bounds()), 15_000);
        assert_eq!(calculate_optimal_batch_size(10_000, &input(SourceType::Api), bounds()), 5_000);
        assert_eq!(calculate_optimal_batch_size(10_000, &input(SourceType::Unknown), bounds()), 10_000);
    }

    #[test]
    fn test_small_estimate_collapses_to_one_batch() {
        let sizing = BatchSizingInput {
            estimated_total_records: Some(3_000),
            ..input(SourceType::Unknown)
        };
        assert_eq!(calculate_optimal_batch_size(10_000, &sizing, bounds()), 3_000);
    }

    #[test]
    fn test_large_estimate_targets_hundred_batches() {
        let sizing = BatchSizingInput {
            estimated_total_records: Some(5_000_000),
            ..input(SourceType::Unknown)
        };
        assert_eq!(calculate_optimal_batch_size(10_000, &sizing, bounds()), 50_000);
    }

    #[test]
    fn test_memory_cap() {
        // 0.5 * 10MB / 1KB = 5120 rows
        let sizing = BatchSizingInput {
            memory_limit_mb: Some(10.0),
            avg_record_size_bytes: Some(1024.0),
            ..input(SourceType::Unknown)
        };
        assert_eq!(calculate_optimal_batch_size(10_000, &sizing, bounds()), 5_120);
    }

    #[test]
    fn test_clamped_to_bounds() {
        let sizing = BatchSizingInput {
            estimated_total_records: Some(10),
            ..input(SourceType::Unknown)
        };
        assert_eq!(calculate_optimal_batch_size(10_000, &sizing, bounds()), 100);

        let narrow = BatchSizeBounds::new(100, 2_000).unwrap();
        assert_eq!(calculate_optimal_batch_size(10_000, &input(SourceType::Storage), narrow), 2_000);
    }

    fn source_type() -> impl Strategy<Value = SourceType> {
        prop_oneof![
            Just(SourceType::Storage),
            Just(SourceType::Relational),
            Just(SourceType::Api),
            Just(SourceType::Unknown),
        ]
    }

    proptest! {
        #[test]
        fn batch_size_always_within_bounds(
            default_size in 0_u64..1_000_000,
            source_type in source_type(),
            estimate in proptest::option::of(0_u64..50_000_000),
            memory_mb in proptest::option::of(0.0_f64..4096.0),
            record_bytes in proptest::option::of(0.0_f64..1_000_000.0),
            min in 1_u64..10_000,
            span in 0_u64..200_000,
        ) {
            let bounds = BatchSizeBounds::new(min, min + span).unwrap();
            let sizing = BatchSizingInput {
                source_type,
                estimated_total_records: estimate,
                memory_limit_mb: memory_mb,
                avg_record_size_bytes: record_bytes,
            };
            let size = calculate_optimal_batch_size(default_size, &sizing, bounds);
            prop_assert!(size >= bounds.min() && size <= bounds.max());
        }
    }
}
