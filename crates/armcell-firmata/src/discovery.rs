/*!
 * Serial port auto-selection.
 *
 * When no port is configured, the session scans the machine's serial ports
 * and picks the first one that looks like the cell's microcontroller: a USB
 * device, or a port whose name matches the usual controller patterns.
 */
use serialport::{SerialPortInfo, SerialPortType};
use tracing::{debug, info};

use crate::error::{BoardError, Result};

/// Port name fragments that identify a controller on the platforms we run on
const NAME_PATTERNS: &[&str] = &["ACM", "ttyUSB", "usbserial", "usbmodem"];

/// Pick the serial port the controller is most likely attached to
pub fn detect_port() -> Result<String> {
    let ports = serialport::available_ports()?;
    debug!(count = ports.len(), "scanning serial ports");

    let mut candidates: Vec<String> = ports
        .iter()
        .filter(|info| is_candidate(info))
        .map(|info| info.port_name.clone())
        .collect();
    candidates.sort();

    match candidates.into_iter().next() {
        Some(port) => {
            info!(%port, "serial port selected");
            Ok(port)
        }
        None => Err(BoardError::DiscoveryFailed(
            "no serial port matching a known controller was found".to_string(),
        )),
    }
}

fn is_candidate(info: &SerialPortInfo) -> bool {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let description = usb.product.as_deref().unwrap_or("");
            description.is_empty()
                || description.contains("Arduino")
                || description.contains("USB")
                || matches_name(&info.port_name)
        }
        _ => matches_name(&info.port_name),
    }
}

fn matches_name(name: &str) -> bool {
    NAME_PATTERNS.iter().any(|pattern| name.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb_info(name: &str, product: Option<&str>) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x2341,
                pid: 0x0043,
                serial_number: None,
                manufacturer: None,
                product: product.map(str::to_string),
            }),
        }
    }

    fn native_info(name: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            port_type: SerialPortType::Unknown,
        }
    }

    #[test]
    fn test_usb_ports_are_candidates() {
        assert!(is_candidate(&usb_info("/dev/ttyACM0", Some("Arduino Uno"))));
        assert!(is_candidate(&usb_info("COM3", Some("USB Serial Device"))));
        assert!(is_candidate(&usb_info("COM4", None)));
    }

    #[test]
    fn test_native_ports_match_by_name() {
        assert!(is_candidate(&native_info("/dev/ttyUSB0")));
        assert!(is_candidate(&native_info("/dev/cu.usbserial-1410")));
        assert!(is_candidate(&native_info("/dev/cu.usbmodem14101")));
        assert!(!is_candidate(&native_info("/dev/ttyS0")));
    }
}
