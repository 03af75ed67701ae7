/*!
 * ArmCell Core
 *
 * This crate provides the foundation for the ArmCell cell controller:
 * the shared error taxonomy, configuration loading, logging setup, and
 * common identifier types.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use serde;
    pub use tracing;
    pub use uuid;
}

/// ArmCell core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("ArmCell Core {} initialized", VERSION);
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
