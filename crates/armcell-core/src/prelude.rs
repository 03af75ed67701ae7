/*!
 * Prelude module for ArmCell Core.
 *
 * This module re-exports commonly used types and functions from the ArmCell
 * Core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::Id;

// Re-export config types
pub use crate::config::{BoardConfig, Config, ConfigBuilder, SharedConfig};

// Re-export logging helpers
pub use crate::logging::{board_span, init_with_filter};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
