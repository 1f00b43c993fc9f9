/*!
 * MapperFlow Core
 *
 * This crate provides the pieces every MapperFlow driver shares:
 * the error type, logging setup, layered configuration, value types
 * and a few async helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// MapperFlow core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization with the default logging filter
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("MapperFlow Core {} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
