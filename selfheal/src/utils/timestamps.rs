//! Timestamp parsing and formatting for watermark values.
//!
//! Incremental columns arrive from heterogeneous sources: ISO-8601 strings
//! from REST APIs, naive `YYYY-MM-DD HH:MM:SS` strings from SQL drivers and
//! unix epochs from object-storage manifests. Everything is normalised to UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestampError {
    /// The JSON value is neither a string nor a number.
    #[error("Unsupported timestamp type: expected string or number")]
    UnsupportedType,

    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),

    /// Nanosecond precision is not supported.
    #[error("Nanosecond precision timestamps are not supported")]
    NanosecondPrecision,
}

/// Detected precision of a Unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnixPrecision {
    /// Seconds (<=10 digits)
    Seconds,
    /// Milliseconds (<=13 digits)
    Milliseconds,
    /// Microseconds (<=16 digits)
    Microseconds,
}

/// Formats a timestamp as an ISO 8601 string with microsecond precision.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use selfheal::utils::format_iso8601;
///
/// let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
/// assert_eq!(format_iso8601(&ts), "2024-03-01T12:00:00.000000+00:00");
/// ```
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Detects the precision of a Unix timestamp based on digit count.
///
/// # Errors
///
/// Returns `TimestampError::NanosecondPrecision` if the timestamp has more than 16 digits.
pub fn detect_unix_precision(timestamp: f64) -> Result<UnixPrecision, TimestampError> {
    let int_part = timestamp.abs().trunc();
    let digit_count = if int_part < 1.0 {
        1
    } else {
        int_part.log10().floor() as usize + 1
    };

    match digit_count {
        0..=10 => Ok(UnixPrecision::Seconds),
        11..=13 => Ok(UnixPrecision::Milliseconds),
        14..=16 => Ok(UnixPrecision::Microseconds),
        _ => Err(TimestampError::NanosecondPrecision),
    }
}

/// Parses a timestamp string.
///
/// Accepts numeric epochs (seconds, milliseconds, microseconds), RFC 3339 /
/// ISO 8601 with or without offset, and naive date-times which are taken as UTC.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }

    if let Ok(num) = trimmed.parse::<f64>() {
        return parse_unix_timestamp(num);
    }

    parse_iso8601(trimmed)
}

/// Parses a JSON cell holding a timestamp.
pub fn parse_timestamp_value(value: &serde_json::Value) -> Result<Timestamp, TimestampError> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or(TimestampError::UnsupportedType)
            .and_then(parse_unix_timestamp),
        _ => Err(TimestampError::UnsupportedType),
    }
}

/// Parses a Unix timestamp with automatic precision detection.
pub fn parse_unix_timestamp(value: f64) -> Result<Timestamp, TimestampError> {
    if !value.is_finite() {
        return Err(TimestampError::InvalidFormat(value.to_string()));
    }

    // Fractional epochs are always seconds.
    if value.fract().abs() > f64::EPSILON {
        let secs = value.trunc() as i64;
        let nanos = (value.fract().abs() * 1_000_000_000.0) as u32;
        return Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| TimestampError::InvalidFormat(value.to_string()));
    }

    let raw = value as i64;
    let (secs, nanos) = match detect_unix_precision(value)? {
        UnixPrecision::Seconds => (raw, 0),
        UnixPrecision::Milliseconds => (raw.div_euclid(1000), raw.rem_euclid(1000) * 1_000_000),
        UnixPrecision::Microseconds => (raw.div_euclid(1_000_000), raw.rem_euclid(1_000_000) * 1000),
    };

    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .ok_or_else(|| TimestampError::InvalidFormat(value.to_string()))
}

fn parse_iso8601(s: &str) -> Result<Timestamp, TimestampError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let offset_formats = ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%z"];
    for fmt in offset_formats {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    let naive_formats = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in naive_formats {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
    }

    Err(TimestampError::InvalidFormat(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_detect_unix_precision() {
        assert_eq!(detect_unix_precision(1696512000.0).unwrap(), UnixPrecision::Seconds);
        assert_eq!(
            detect_unix_precision(1696512000000.0).unwrap(),
            UnixPrecision::Milliseconds
        );
        assert_eq!(
            detect_unix_precision(1696512000000000.0).unwrap(),
            UnixPrecision::Microseconds
        );
        assert!(detect_unix_precision(1696512000000000000.0).is_err());
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let dt = parse_timestamp("2023-10-05T16:30:00+02:00").unwrap();
        assert_eq!(dt.hour(), 14);
        assert_eq!(dt.day(), 5);
    }

    #[test]
    fn test_parse_zulu_and_naive_agree() {
        let zulu = parse_timestamp("2023-10-05T14:30:00Z").unwrap();
        let naive = parse_timestamp("2023-10-05 14:30:00").unwrap();
        assert_eq!(zulu, naive);
    }

    #[test]
    fn test_parse_date_only() {
        let dt = parse_timestamp("2024-02-29").unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day(), dt.hour()), (2024, 2, 29, 0));
    }

    #[test]
    fn test_parse_unix_millis_value() {
        let dt = parse_timestamp_value(&serde_json::json!(1696512000123_i64)).unwrap();
        assert_eq!(dt.timestamp(), 1696512000);
        assert_eq!(dt.timestamp_subsec_millis(), 123);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_timestamp("  "), Err(TimestampError::EmptyString));
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TimestampError::InvalidFormat(_))
        ));
        assert_eq!(
            parse_timestamp_value(&serde_json::json!(true)),
            Err(TimestampError::UnsupportedType)
        );
    }

    #[test]
    fn test_format_roundtrips_through_parse() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let formatted = format_iso8601(&ts);
        assert_eq!(formatted, "2024-01-02T03:04:05.000000+00:00");
        assert_eq!(parse_timestamp(&formatted).unwrap(), ts);
    }
}
