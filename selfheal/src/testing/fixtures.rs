//! Dataset and clock fixtures.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::Dataset;
use crate::resilience::RetryConfig;
use crate::utils::{format_iso8601, ManualClock, Timestamp};

/// Fixed reference time used by fixtures: 2024-06-01T12:00:00Z.
#[must_use]
pub fn reference_time() -> Timestamp {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Returns a manual clock frozen at [`reference_time`].
#[must_use]
pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(reference_time()))
}

/// Retry policy with millisecond backoff, for fast tests.
#[must_use]
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(10)
}

/// Dataset with `id` (1..=n) and `name` columns.
#[must_use]
pub fn numbered_rows(n: usize) -> Dataset {
    let rows = (1..=n)
        .map(|i| vec![json!(i), json!(format!("row-{i}"))])
        .collect();
    Dataset::from_parts(vec!["id".into(), "name".into()], rows)
}

/// Dataset with `id` and an `updated_at` column holding the given times as ISO strings.
#[must_use]
pub fn timestamped_rows(times: &[Timestamp]) -> Dataset {
    values_dataset(
        "updated_at",
        times.iter().map(|t| Value::String(format_iso8601(t))),
    )
}

/// Dataset with `id` and a `column` holding `values`.
#[must_use]
pub fn values_dataset(column: &str, values: impl IntoIterator<Item = Value>) -> Dataset {
    let rows = values
        .into_iter()
        .enumerate()
        .map(|(i, v)| vec![json!(i + 1), v])
        .collect();
    Dataset::from_parts(vec!["id".into(), column.to_string()], rows)
}
