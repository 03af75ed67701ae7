/*!
 * ArmCell Firmata
 *
 * This crate is the device communication protocol engine for the ArmCell
 * cell controller: byte-stream framing, command dispatch, the pin/port
 * state model, capability-based auto-configuration, and the background
 * polling loop that keeps pin values fresh.
 */

#![warn(missing_docs)]

pub mod board;
pub mod command;
pub mod decoder;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod pin;
mod poller;
pub mod protocol;
pub mod transport;

// Re-export the primary session types
pub use board::{Board, BoardBuilder, BoardEvent, FirmwareInfo, PinHandle, SessionState};
pub use error::{BoardError, Result};
pub use layout::Layout;
pub use pin::{PinAddress, PinKind, PinMode, PinValue};
pub use transport::{LoopbackTransport, SerialTransport, Transport};

/// ArmCell firmata crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the protocol engine crate
pub fn init() -> std::result::Result<(), armcell_core::error::Error> {
    tracing::info!("ArmCell Firmata {} initialized", VERSION);
    Ok(())
}
