//! Structured logging setup

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Build the filter for `log_level`, falling back to `info` when it does not parse
pub fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize JSON tracing output for the service
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &Config) -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(&config.service.log_level))
        .try_init()
        .map_err(|e| crate::error::Error::Internal(format!("Failed to initialize tracing: {e}")))?;

    tracing::info!(
        environment = %config.service.environment,
        "Tracing initialized for service: {}",
        config.service.name
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        assert_eq!(env_filter("projects=loudest").to_string(), "info");
        assert_eq!(env_filter("debug").to_string(), "debug");
    }

    #[test]
    fn test_init_tracing() {
        let config = Config::default();
        // A second install in the same process is rejected, not a panic
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
