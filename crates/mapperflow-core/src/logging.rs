/*!
 * Logging functionality for MapperFlow.
 *
 * This module provides tracing setup and the spans drivers attach to
 * per-device background work, so reconnect and publish logs carry the
 * device they belong to.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_config(&LoggingConfig::default())
}

/// Initialize the logging system from a logging configuration section
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(config.show_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Create a span for a named operation on a device
///
/// # Arguments
///
/// * `name` - The operation name (e.g. "reconnect", "publish")
/// * `device_id` - The device the operation runs for
pub fn operation_span(name: &str, device_id: &str) -> tracing::Span {
    tracing::info_span!("operation", name = %name, device = %device_id)
}
