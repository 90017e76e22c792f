use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};

/// Installs a fmt subscriber filtered by `RUST_LOG`, falling back to `level`.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init_tracing(level: &str) -> EngineResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| EngineError::config_error(format!("invalid log level {}: {}", level, e)))?,
    };

    Ok(tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(false)
        .try_init()
        .is_ok())
}

/// Installs a subscriber using the configured log level
pub fn init_from_config(config: &EngineConfig) -> EngineResult<bool> {
    init_tracing(&config.log_level)
}
