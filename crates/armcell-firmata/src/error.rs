/*!
 * Error types for the board protocol engine.
 */
use thiserror::Error;

use crate::pin::PinAddress;

/// Error type for board operations
#[derive(Error, Debug)]
pub enum BoardError {
    /// Channel-level transport failure; fatal to the current session
    #[error("Transport error: {0}")]
    Transport(String),

    /// No usable layout could be established; fatal to board construction
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The pin index does not exist in the board layout
    #[error("Invalid pin index: {0}")]
    InvalidIndex(PinAddress),

    /// The pin is marked unavailable in the board layout
    #[error("Pin {0} is disabled")]
    Disabled(PinAddress),

    /// The pin is already acquired by another caller
    #[error("Pin {0} is already taken")]
    AlreadyOwned(PinAddress),

    /// The requested operation is not valid for the pin's kind, mode, or capabilities
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A dispatched frame carried a value that cannot be interpreted
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The board is not in the running state
    #[error("Board is not ready: {0}")]
    NotReady(String),

    /// A value does not fit the wire encoding's 14-bit range
    #[error("Value {0} does not fit in 14 bits")]
    ValueOutOfRange(u16),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] armcell_core::error::Error),
}

/// Result type for board operations
pub type Result<T> = std::result::Result<T, BoardError>;

impl BoardError {
    /// Create a new unsupported-operation error
    pub fn unsupported<S: AsRef<str>>(msg: S) -> Self {
        BoardError::UnsupportedOperation(msg.as_ref().to_string())
    }

    /// Create a new malformed-frame error
    pub fn malformed<S: AsRef<str>>(msg: S) -> Self {
        BoardError::MalformedFrame(msg.as_ref().to_string())
    }

    /// Create a new not-ready error
    pub fn not_ready<S: AsRef<str>>(msg: S) -> Self {
        BoardError::NotReady(msg.as_ref().to_string())
    }
}

impl From<std::io::Error> for BoardError {
    fn from(err: std::io::Error) -> Self {
        BoardError::Transport(err.to_string())
    }
}

impl From<serialport::Error> for BoardError {
    fn from(err: serialport::Error) -> Self {
        BoardError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinKind;

    #[test]
    fn test_display() {
        let addr = PinAddress::new(PinKind::Digital, 13);
        assert_eq!(
            format!("{}", BoardError::AlreadyOwned(addr)),
            "Pin d:13 is already taken"
        );
        assert_eq!(
            format!("{}", BoardError::ValueOutOfRange(20000)),
            "Value 20000 does not fit in 14 bits"
        );
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(BoardError::from(io), BoardError::Transport(_)));
    }
}
