//! # Structured Logging
//!
//! Installs the global `tracing` subscriber. Every registry and balancer event is
//! emitted through `tracing` macros with structured fields (`service`,
//! `instance_id`, `attempt`, ...), so the JSON format is directly indexable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config_error;
use crate::core::error::RouterResult;
use crate::observability::config::{LogConfig, LogFormat};

/// Build the filter: `RUST_LOG` wins, otherwise the configured level directive
pub fn build_filter(config: &LogConfig) -> RouterResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| config_error!("Invalid log level '{}': {}", config.level, e)),
    }
}

/// Initialize the global tracing subscriber
///
/// Fails if a global subscriber has already been installed.
pub fn init_logging(config: &LogConfig) -> RouterResult<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .json(),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| config_error!("Failed to install tracing subscriber: {}", e))
}
