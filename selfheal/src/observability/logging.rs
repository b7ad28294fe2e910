//! Log subscriber installation.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::errors::{ExtractionError, Result};

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level`. Fails if the level is not a valid
/// filter directive or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ExtractionError::Configuration(format!("invalid log level '{}': {e}", config.level))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ExtractionError::Configuration(format!("logging already initialised: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error_not_a_panic() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
