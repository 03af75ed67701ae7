/*!
 * Pin and port state models.
 *
 * This module defines the addressable unit of I/O (a digital or analog pin
 * with a mode, an ownership flag, a last-known value, and an optional change
 * callback) and the 8-pin port grouping that digital pins report through.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BoardError, Result};

/// Whether a pin lives in the digital or the analog index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinKind {
    /// Digital pin, addressed by board index
    Digital,
    /// Analog pin, addressed by layout index and reported by wire channel
    Analog,
}

/// The public address of a pin: `(kind, index)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinAddress {
    /// The pin's index space
    pub kind: PinKind,
    /// The pin's index within that space
    pub index: u8,
}

impl PinAddress {
    /// Create a new pin address
    pub fn new(kind: PinKind, index: u8) -> Self {
        Self { kind, index }
    }

    /// Shorthand for a digital address
    pub fn digital(index: u8) -> Self {
        Self::new(PinKind::Digital, index)
    }

    /// Shorthand for an analog address
    pub fn analog(index: u8) -> Self {
        Self::new(PinKind::Analog, index)
    }
}

impl fmt::Display for PinAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            PinKind::Digital => 'd',
            PinKind::Analog => 'a',
        };
        write!(f, "{}:{}", prefix, self.index)
    }
}

impl FromStr for PinAddress {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, _) = parse_pin_spec(s)?;
        Ok(addr)
    }
}

/// Pin operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinMode {
    /// Digital input
    Input,
    /// Digital input with the internal pull-up enabled
    InputPullup,
    /// Digital output
    Output,
    /// PWM output
    Pwm,
    /// Servo output
    Servo,
    /// The pin cannot be used; terminal state
    Unavailable,
}

impl PinMode {
    /// The wire code for this mode, if the mode can be sent to the device
    pub fn wire_code(self) -> Option<u8> {
        match self {
            PinMode::Input => Some(0),
            PinMode::Output => Some(1),
            PinMode::Pwm => Some(3),
            PinMode::Servo => Some(4),
            PinMode::InputPullup => Some(11),
            PinMode::Unavailable => None,
        }
    }

    /// Whether this mode receives push reports from the device
    pub fn is_input(self) -> bool {
        matches!(self, PinMode::Input | PinMode::InputPullup)
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PinMode::Input => "input",
            PinMode::InputPullup => "input-pullup",
            PinMode::Output => "output",
            PinMode::Pwm => "pwm",
            PinMode::Servo => "servo",
            PinMode::Unavailable => "unavailable",
        };
        write!(f, "{}", name)
    }
}

/// A typed pin value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinValue {
    /// Digital level
    Digital(bool),
    /// Normalized analog reading or PWM duty, in [0, 1]
    Analog(f64),
    /// Servo angle in degrees
    Angle(u16),
}

impl fmt::Display for PinValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinValue::Digital(level) => write!(f, "{}", if *level { "high" } else { "low" }),
            PinValue::Analog(v) => write!(f, "{:.4}", v),
            PinValue::Angle(deg) => write!(f, "{}deg", deg),
        }
    }
}

/// A pin change callback, invoked with the new value
pub type PinCallback = Arc<dyn Fn(PinValue) + Send + Sync>;

/// A digital pin's place within its report port, derived once at layout
/// construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSlot {
    /// Port index
    pub port: u8,
    /// Bit offset within the port, 0..8
    pub offset: u8,
}

/// The state of one addressable pin
pub struct Pin {
    /// Public index (digital board index, or analog index as listed in the layout)
    pub index: u8,
    /// Index space this pin lives in
    pub kind: PinKind,
    /// Current operating mode
    pub mode: PinMode,
    /// Whether the pin supports PWM output
    pub pwm_capable: bool,
    /// Whether change reports are enabled for this pin
    pub reporting: bool,
    /// Last known value, if any report or write has happened
    pub value: Option<PinValue>,
    /// Change callback slot; a cleared slot is silently ignored at dispatch
    pub callback: Option<PinCallback>,
    /// Port membership for digital pins
    pub slot: Option<PortSlot>,
    /// Wire channel for analog pins (position in the layout's analog list)
    pub channel: Option<u8>,
}

impl Pin {
    /// Create a digital pin with its port slot
    pub fn digital(index: u8, slot: PortSlot) -> Self {
        Self {
            index,
            kind: PinKind::Digital,
            mode: PinMode::Output,
            pwm_capable: false,
            reporting: false,
            value: None,
            callback: None,
            slot: Some(slot),
            channel: None,
        }
    }

    /// Create an analog pin with its wire channel
    pub fn analog(index: u8, channel: u8) -> Self {
        Self {
            index,
            kind: PinKind::Analog,
            mode: PinMode::Input,
            pwm_capable: false,
            reporting: false,
            value: None,
            callback: None,
            slot: None,
            channel: Some(channel),
        }
    }

    /// The public address of this pin
    pub fn address(&self) -> PinAddress {
        PinAddress::new(self.kind, self.index)
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pin")
            .field("address", &self.address().to_string())
            .field("mode", &self.mode)
            .field("pwm_capable", &self.pwm_capable)
            .field("reporting", &self.reporting)
            .field("value", &self.value)
            .field("has_callback", &self.callback.is_some())
            .field("slot", &self.slot)
            .field("channel", &self.channel)
            .finish()
    }
}

/// A group of up to 8 digital pins sharing one report message
#[derive(Debug)]
pub struct Port {
    /// Port index
    pub index: u8,
    /// Whether the device reports this port's input changes
    pub reporting: bool,
    /// Digital indices of the member pins, in offset order
    pub pins: Vec<u8>,
}

impl Port {
    /// Create a port over the given member pin indices
    pub fn new(index: u8, pins: Vec<u8>) -> Self {
        Self {
            index,
            reporting: false,
            pins,
        }
    }
}

/// Parse a pin specification string: `"d:13:o"`, `"d:9:p"`, `"a:2"`.
///
/// The kind letter is `d` or `a`; the mode letter is `i` (input),
/// `u` (input-pullup), `o` (output), `p` (pwm), or `s` (servo). Analog pins
/// take no mode letter and default to input; digital pins default to input
/// when the letter is omitted.
pub fn parse_pin_spec(spec: &str) -> Result<(PinAddress, PinMode)> {
    let mut parts = spec.split(':');
    let kind = match parts.next() {
        Some("d") => PinKind::Digital,
        Some("a") => PinKind::Analog,
        _ => {
            return Err(BoardError::unsupported(format!(
                "invalid pin spec '{}': kind must be 'd' or 'a'",
                spec
            )))
        }
    };
    let index = parts
        .next()
        .and_then(|s| s.parse::<u8>().ok())
        .ok_or_else(|| {
            BoardError::unsupported(format!("invalid pin spec '{}': missing pin index", spec))
        })?;
    let mode = match (kind, parts.next()) {
        (PinKind::Analog, None) => PinMode::Input,
        (PinKind::Analog, Some(_)) => {
            return Err(BoardError::unsupported(format!(
                "invalid pin spec '{}': analog pins take no mode letter",
                spec
            )))
        }
        (PinKind::Digital, None) | (PinKind::Digital, Some("i")) => PinMode::Input,
        (PinKind::Digital, Some("u")) => PinMode::InputPullup,
        (PinKind::Digital, Some("o")) => PinMode::Output,
        (PinKind::Digital, Some("p")) => PinMode::Pwm,
        (PinKind::Digital, Some("s")) => PinMode::Servo,
        (PinKind::Digital, Some(other)) => {
            return Err(BoardError::unsupported(format!(
                "invalid pin spec '{}': unknown mode letter '{}'",
                spec, other
            )))
        }
    };
    if parts.next().is_some() {
        return Err(BoardError::unsupported(format!(
            "invalid pin spec '{}': trailing segments",
            spec
        )));
    }
    Ok((PinAddress::new(kind, index), mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        assert_eq!(PinAddress::digital(13).to_string(), "d:13");
        assert_eq!(PinAddress::analog(2).to_string(), "a:2");
    }

    #[test]
    fn test_mode_wire_codes() {
        assert_eq!(PinMode::Input.wire_code(), Some(0));
        assert_eq!(PinMode::Output.wire_code(), Some(1));
        assert_eq!(PinMode::Pwm.wire_code(), Some(3));
        assert_eq!(PinMode::Servo.wire_code(), Some(4));
        assert_eq!(PinMode::InputPullup.wire_code(), Some(11));
        assert_eq!(PinMode::Unavailable.wire_code(), None);
    }

    #[test]
    fn test_parse_pin_spec() {
        assert_eq!(
            parse_pin_spec("d:13:o").unwrap(),
            (PinAddress::digital(13), PinMode::Output)
        );
        assert_eq!(
            parse_pin_spec("d:9:p").unwrap(),
            (PinAddress::digital(9), PinMode::Pwm)
        );
        assert_eq!(
            parse_pin_spec("d:6:s").unwrap(),
            (PinAddress::digital(6), PinMode::Servo)
        );
        assert_eq!(
            parse_pin_spec("d:2").unwrap(),
            (PinAddress::digital(2), PinMode::Input)
        );
        assert_eq!(
            parse_pin_spec("a:2").unwrap(),
            (PinAddress::analog(2), PinMode::Input)
        );
    }

    #[test]
    fn test_parse_pin_spec_rejects_garbage() {
        assert!(parse_pin_spec("x:1").is_err());
        assert!(parse_pin_spec("d:").is_err());
        assert!(parse_pin_spec("d:13:z").is_err());
        assert!(parse_pin_spec("a:2:p").is_err());
        assert!(parse_pin_spec("d:13:o:extra").is_err());
    }

    #[test]
    fn test_pin_value_equality() {
        assert_eq!(PinValue::Digital(true), PinValue::Digital(true));
        assert_ne!(PinValue::Digital(true), PinValue::Digital(false));
        assert_eq!(PinValue::Analog(0.5), PinValue::Analog(0.5));
        assert_ne!(PinValue::Analog(0.5), PinValue::Angle(90));
    }

    #[test]
    fn test_pin_constructors() {
        let pin = Pin::digital(9, PortSlot { port: 1, offset: 1 });
        assert_eq!(pin.address(), PinAddress::digital(9));
        assert_eq!(pin.mode, PinMode::Output);
        assert!(!pin.reporting);

        let pin = Pin::analog(14, 0);
        assert_eq!(pin.address(), PinAddress::analog(14));
        assert_eq!(pin.channel, Some(0));
        assert_eq!(pin.mode, PinMode::Input);
    }
}
