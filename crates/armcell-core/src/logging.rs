/*!
 * Logging functionality for ArmCell.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the ArmCell crates.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "armcell_firmata=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Create a new span for a board instance
///
/// # Arguments
///
/// * `name` - The board name
/// * `port` - The serial port the board is attached to, if known
pub fn board_span(name: &str, port: Option<&str>) -> tracing::Span {
    match port {
        Some(port) => tracing::info_span!("board", name = %name, port = %port),
        None => tracing::info_span!("board", name = %name),
    }
}
