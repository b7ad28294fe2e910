//! Per-resource circuit breaker.
//!
//! A breaker counts consecutive failures against one named resource. Once
//! the count reaches the threshold it opens and refuses calls until the
//! reset timeout has passed since the last failure; the next call is then
//! let through as a trial call (half-open). Only one trial call is in
//! flight at a time. Its success closes the breaker, its failure reopens it
//! immediately.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::CircuitOpenError;
use crate::utils::{elapsed_since, system_clock, Clock, Timestamp};

fn default_failure_threshold() -> u32 {
    5
}

fn default_reset_timeout_seconds() -> f64 {
    60.0
}

/// Thresholds for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds after the last failure before a trial call is allowed.
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub fn with_reset_timeout_seconds(mut self, seconds: f64) -> Self {
        self.reset_timeout_seconds = seconds;
        self
    }

    /// Returns the reset timeout. Negative or non-finite values read as zero.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.reset_timeout_seconds).unwrap_or(Duration::ZERO)
    }
}

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused.
    Open,
    /// Trial calls are allowed.
    HalfOpen,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Resource name.
    pub name: String,
    /// Configured threshold.
    pub failure_threshold: u32,
    /// Configured reset timeout in seconds.
    pub reset_timeout_seconds: f64,
    /// True while calls are refused.
    pub is_open: bool,
    /// True while trial calls are allowed.
    pub half_open: bool,
    /// Consecutive failures.
    pub failure_count: u32,
    /// Time of the most recent failure.
    pub last_failure_time: Option<Timestamp>,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<Timestamp>,
    /// Set while a half-open trial call is outstanding.
    trial_started: Option<Timestamp>,
}

impl Counters {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            trial_started: None,
        }
    }
}

/// Failure tracker for one named resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    /// Creates a closed breaker on the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, system_clock())
    }

    /// Creates a closed breaker on the given clock.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            counters: Mutex::new(Counters::closed()),
        }
    }

    /// Returns the resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the thresholds.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current position without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.counters.lock().state
    }

    /// Decides whether a call may proceed.
    ///
    /// An open breaker whose reset timeout has strictly elapsed since the
    /// last failure moves to half-open and allows the call as a trial.
    /// While it is outstanding other callers are refused. A trial call that
    /// never reports back is given up after another reset timeout.
    pub fn allow_request(&self) -> bool {
        let mut counters = self.counters.lock();
        match counters.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                let free = counters.trial_started.map_or(true, |at| {
                    elapsed_since(self.clock.as_ref(), at) > self.config.reset_timeout()
                });
                if free {
                    counters.trial_started = Some(self.clock.now());
                }
                free
            }
            CircuitState::Open => {
                let cooled = counters.last_failure_time.map_or(true, |at| {
                    elapsed_since(self.clock.as_ref(), at) > self.config.reset_timeout()
                });
                if cooled {
                    counters.state = CircuitState::HalfOpen;
                    counters.trial_started = Some(self.clock.now());
                    tracing::info!(breaker = %self.name, "Circuit breaker half-open, allowing trial call");
                }
                cooled
            }
        }
    }

    /// Gives back a half-open trial call whose outcome says nothing about the
    /// resource, so the next caller can try instead.
    pub fn release_trial(&self) {
        self.counters.lock().trial_started = None;
    }

    /// Records a successful call and closes the breaker.
    pub fn record_success(&self) {
        let mut counters = self.counters.lock();
        if counters.state != CircuitState::Closed {
            tracing::info!(breaker = %self.name, "Circuit breaker closed");
        }
        counters.state = CircuitState::Closed;
        counters.failure_count = 0;
        counters.trial_started = None;
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut counters = self.counters.lock();
        counters.failure_count = counters.failure_count.saturating_add(1);
        counters.last_failure_time = Some(self.clock.now());
        counters.trial_started = None;

        let should_open = match counters.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => counters.failure_count >= self.config.failure_threshold.max(1),
            CircuitState::Open => false,
        };
        if should_open {
            counters.state = CircuitState::Open;
            tracing::warn!(
                breaker = %self.name,
                failure_count = counters.failure_count,
                reset_timeout_seconds = self.config.reset_timeout_seconds,
                "Circuit breaker opened"
            );
        }
    }

    /// Forces the breaker closed and clears its history.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::closed();
        tracing::debug!(breaker = %self.name, "Circuit breaker reset");
    }

    /// Returns the time left before an open breaker admits a trial call.
    #[must_use]
    pub fn time_until_reset(&self) -> Duration {
        let counters = self.counters.lock();
        match (counters.state, counters.last_failure_time) {
            (CircuitState::Open, Some(at)) => self
                .config
                .reset_timeout()
                .saturating_sub(elapsed_since(self.clock.as_ref(), at)),
            _ => Duration::ZERO,
        }
    }

    /// Builds the refusal error for this breaker.
    #[must_use]
    pub fn open_error(&self, last_error: Option<String>) -> CircuitOpenError {
        let err = CircuitOpenError::new(self.name.clone(), self.time_until_reset());
        match last_error {
            Some(message) => err.with_last_error(message),
            None => err,
        }
    }

    /// Returns a point-in-time view.
    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let counters = self.counters.lock();
        CircuitBreakerState {
            name: self.name.clone(),
            failure_threshold: self.config.failure_threshold,
            reset_timeout_seconds: self.config.reset_timeout_seconds,
            is_open: counters.state == CircuitState::Open,
            half_open: counters.state == CircuitState::HalfOpen,
            failure_count: counters.failure_count,
            last_failure_time: counters.last_failure_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use chrono::{TimeZone, Utc};

    fn breaker(threshold: u32, timeout: f64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(threshold)
            .with_reset_timeout_seconds(timeout);
        let breaker = CircuitBreaker::with_clock("extract:orders", config, clock.clone());
        (breaker, clock)
    }

    #[test]
    fn test_config_defaults() {
        let config: CircuitBreakerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout(), Duration::from_secs(60));
        assert_eq!(
            CircuitBreakerConfig::default()
                .with_reset_timeout_seconds(-1.0)
                .reset_timeout(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_opens_at_threshold() {
        let (breaker, _clock) = breaker(3, 60.0);

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_count() {
        let (breaker, _clock) = breaker(2, 60.0);
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[test]
    fn test_half_open_after_timeout_strictly_elapsed() {
        let (breaker, clock) = breaker(1, 30.0);
        breaker.record_failure();

        clock.advance(Duration::from_secs(30));
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_millis(1));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_admits_one_trial_at_a_time() {
        let (breaker, clock) = breaker(1, 30.0);
        breaker.record_failure();
        clock.advance(Duration::from_secs(31));

        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
        assert!(!breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert!(breaker.allow_request());
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_released_trial_lets_next_caller_try() {
        let (breaker, clock) = breaker(1, 30.0);
        breaker.record_failure();
        clock.advance(Duration::from_secs(31));

        assert!(breaker.allow_request());
        breaker.release_trial();
        assert!(breaker.allow_request());
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_abandoned_trial_expires_after_reset_timeout() {
        let (breaker, clock) = breaker(1, 30.0);
        breaker.record_failure();
        clock.advance(Duration::from_secs(31));
        assert!(breaker.allow_request());

        clock.advance(Duration::from_secs(30));
        assert!(!breaker.allow_request());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let (breaker, clock) = breaker(3, 10.0);
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance(Duration::from_secs(11));
        assert!(breaker.allow_request());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
        assert_eq!(breaker.time_until_reset(), Duration::from_secs(10));
    }

    #[test]
    fn test_half_open_trial_success_closes() {
        let (breaker, clock) = breaker(1, 10.0);
        breaker.record_failure();
        clock.advance(Duration::from_secs(11));
        assert!(breaker.allow_request());

        breaker.record_success();
        let snapshot = breaker.snapshot();
        assert!(!snapshot.is_open);
        assert!(!snapshot.half_open);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[test]
    fn test_open_error_reports_remaining_time() {
        let (breaker, clock) = breaker(1, 60.0);
        breaker.record_failure();
        clock.advance(Duration::from_secs(15));

        let err = breaker.open_error(Some("connection refused".into()));
        assert_eq!(err.breaker, "extract:orders");
        assert_eq!(err.retry_after, Duration::from_secs(45));
        assert_eq!(err.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (breaker, _clock) = breaker(1, 60.0);
        breaker.record_failure();
        breaker.reset();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.name, "extract:orders");
        assert!(!snapshot.is_open);
        assert_eq!(snapshot.last_failure_time, None);
        assert_eq!(breaker.time_until_reset(), Duration::ZERO);
    }
}
