//! Named circuit breakers shared by the extraction components.

use dashmap::DashMap;
use std::sync::Arc;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
use crate::utils::{system_clock, Clock};

/// Breaker name for extraction calls against a source.
#[must_use]
pub fn extract_breaker_name(source_id: &str) -> String {
    format!("extract:{source_id}")
}

/// Breaker name for state store calls against a collection.
#[must_use]
pub fn state_store_breaker_name(collection: &str) -> String {
    format!("state_store:{collection}")
}

/// Owns one [`CircuitBreaker`] per resource name.
///
/// Breakers live as long as the registry; components hold it behind an
/// `Arc` and look breakers up by name.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry on the system clock.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_clock(defaults, system_clock())
    }

    /// Creates an empty registry on the given clock.
    #[must_use]
    pub fn with_clock(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `name`, creating it with the default thresholds.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, &self.defaults)
    }

    /// Returns the breaker for `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps the thresholds it was created with.
    pub fn get_or_create_with(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::with_clock(
                    name,
                    config.clone(),
                    Arc::clone(&self.clock),
                ))
            })
            .value()
            .clone()
    }

    /// Returns the breaker for `name` if it exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Resets one breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Resets every breaker.
    pub fn reset_all(&self) {
        for entry in &self.breakers {
            entry.value().reset();
        }
    }

    /// Returns snapshots of all breakers, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
        let mut states: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Returns the number of breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    #[test]
    fn test_names() {
        assert_eq!(extract_breaker_name("pg-main"), "extract:pg-main");
        assert_eq!(
            state_store_breaker_name("incremental_extraction_state"),
            "state_store:incremental_extraction_state"
        );
    }

    #[test]
    fn test_get_or_create_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("extract:a");
        let b = registry.get_or_create("extract:a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("extract:b").is_none());
    }

    #[test]
    fn test_existing_breaker_keeps_config() {
        let registry = CircuitBreakerRegistry::default();
        let first = registry.get_or_create_with(
            "extract:a",
            &CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        let again = registry.get_or_create("extract:a");
        assert_eq!(first.config().failure_threshold, 1);
        assert_eq!(again.config().failure_threshold, 1);
    }

    #[test]
    fn test_snapshot_sorted_and_reset() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        registry.get_or_create("state_store:x");
        registry.get_or_create("extract:z").record_failure();

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["extract:z", "state_store:x"]);

        assert!(registry.reset("extract:z"));
        assert!(!registry.reset("extract:missing"));
        assert_eq!(
            registry.get("extract:z").unwrap().state(),
            CircuitState::Closed
        );
    }

    #[test]
    fn test_reset_all() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        registry.get_or_create("a").record_failure();
        registry.get_or_create("b").record_failure();
        registry.reset_all();
        assert!(registry.snapshot().iter().all(|s| !s.is_open));
    }
}
