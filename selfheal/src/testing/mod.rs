//! Testing utilities for extraction code.
//!
//! This module provides:
//! - Connector doubles that page, replay or fail on demand
//! - A state store with switchable failures
//! - Dataset and clock fixtures

mod fixtures;
mod mocks;

pub use fixtures::{
    fast_retry, manual_clock, numbered_rows, reference_time, timestamped_rows, values_dataset,
};
pub use mocks::{FailingStateStore, PagedConnector, ScriptedConnector};
