//! Failure isolation for connector and state store calls.

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState};
pub use registry::{extract_breaker_name, state_store_breaker_name, CircuitBreakerRegistry};
pub use retry::{JitterStrategy, RetryConfig, RetryExecutor};
