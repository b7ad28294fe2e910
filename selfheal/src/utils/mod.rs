//! Time handling shared by the resilience and extraction layers.

pub mod clock;
pub mod timestamps;

pub use clock::{elapsed_since, system_clock, Clock, ManualClock, SystemClock};
pub use timestamps::{
    format_iso8601, parse_timestamp, parse_timestamp_value, Timestamp,
    TimestampError, UnixPrecision,
};
