/*!
 * Prelude module for MapperFlow Core.
 *
 * This module re-exports commonly used types and functions from the
 * MapperFlow Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DeviceId, UnsupportedType, Value};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, DriverConfig, LoggingConfig};

// Re-export utility functions
pub use crate::utils::{millis_to_duration, spawn_in_span, with_timeout};

// Re-export logging helpers and macros
pub use crate::logging::operation_span;
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
