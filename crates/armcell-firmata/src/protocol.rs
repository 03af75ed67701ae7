/*!
 * Wire protocol definitions for the board link.
 *
 * This module defines the command bytes, the two-byte value encoding used
 * for every 14-bit quantity on the wire, and builders for each outbound
 * frame. Frames are assembled into [`Bytes`] buffers and handed to the
 * transport verbatim.
 */
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{BoardError, Result};

/// Digital port report / write command (high nibble; low nibble is the port)
pub const DIGITAL_MESSAGE: u8 = 0x90;
/// Analog value report / write command (high nibble; low nibble is the channel)
pub const ANALOG_MESSAGE: u8 = 0xE0;
/// Toggle analog channel reporting (low nibble is the channel)
pub const REPORT_ANALOG: u8 = 0xC0;
/// Toggle digital port reporting (low nibble is the port)
pub const REPORT_DIGITAL: u8 = 0xD0;
/// Start marker for extended (sysex) messages
pub const START_SYSEX: u8 = 0xF0;
/// Set a pin's mode
pub const SET_PIN_MODE: u8 = 0xF4;
/// End marker for extended (sysex) messages
pub const END_SYSEX: u8 = 0xF7;
/// Protocol version report
pub const REPORT_VERSION: u8 = 0xF9;
/// Reset the device to its power-up state
pub const SYSTEM_RESET: u8 = 0xFF;

/// Sysex: query per-pin capabilities
pub const CAPABILITY_QUERY: u8 = 0x6B;
/// Sysex: per-pin capability response
pub const CAPABILITY_RESPONSE: u8 = 0x6C;
/// Sysex: query the analog channel mapping
pub const ANALOG_MAPPING_QUERY: u8 = 0x69;
/// Sysex: analog channel mapping response
pub const ANALOG_MAPPING_RESPONSE: u8 = 0x6A;
/// Sysex: servo pulse-width configuration
pub const SERVO_CONFIG: u8 = 0x70;
/// Sysex: free-form text from the device
pub const STRING_DATA: u8 = 0x71;
/// Sysex: query firmware version and name
pub const REPORT_FIRMWARE: u8 = 0x79;
/// Sysex: set the device-side sampling interval
pub const SAMPLING_INTERVAL: u8 = 0x7A;

/// Terminates one pin's record inside a capability response
pub const CAPABILITY_SENTINEL: u8 = 0x7F;

/// Largest value representable in the two-byte encoding
pub const U14_MAX: u16 = 0x3FFF;

/// Full-scale raw reading of the device ADC
pub const ANALOG_FULL_SCALE: f64 = 1023.0;

/// Default servo minimum pulse width, microseconds
pub const SERVO_MIN_PULSE: u16 = 544;
/// Default servo maximum pulse width, microseconds
pub const SERVO_MAX_PULSE: u16 = 2400;

/// Encode a 14-bit quantity as `[value & 0x7F, value >> 7]`
///
/// Values above [`U14_MAX`] are rejected before encoding.
pub fn encode_u14(value: u16) -> Result<[u8; 2]> {
    if value > U14_MAX {
        return Err(BoardError::ValueOutOfRange(value));
    }
    Ok([(value & 0x7F) as u8, (value >> 7) as u8])
}

/// Decode a two-byte quantity: `(msb << 7) | lsb`
pub fn decode_u14(lsb: u8, msb: u8) -> u16 {
    ((msb as u16) << 7) | (lsb as u16 & 0x7F)
}

/// Decode a firmware-style string: two bytes per character, low 7 bits first
pub fn decode_7bit_string(data: &[u8]) -> String {
    let mut out = Vec::with_capacity(data.len() / 2 + 1);
    let mut iter = data.iter();
    while let Some(&lsb) = iter.next() {
        let msb = iter.next().copied().unwrap_or(0);
        out.push(decode_u14(lsb, msb) as u8);
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Assemble an extended message: start marker, command, payload, end marker
pub fn sysex(command: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 3);
    buf.put_u8(START_SYSEX);
    buf.put_u8(command);
    buf.put_slice(payload);
    buf.put_u8(END_SYSEX);
    buf.freeze()
}

/// Frame: set the mode of a pin
pub fn set_pin_mode(pin: u8, mode_code: u8) -> Bytes {
    Bytes::from(vec![SET_PIN_MODE, pin, mode_code])
}

/// Frame: enable or disable reporting for an analog channel
pub fn report_analog(channel: u8, enable: bool) -> Bytes {
    Bytes::from(vec![REPORT_ANALOG + channel, enable as u8])
}

/// Frame: enable or disable reporting for a digital port
pub fn report_digital(port: u8, enable: bool) -> Bytes {
    Bytes::from(vec![REPORT_DIGITAL + port, enable as u8])
}

/// Frame: write a full port's output bitmask
pub fn digital_port_write(port: u8, mask: u16) -> Result<Bytes> {
    let [lsb, msb] = encode_u14(mask)?;
    Ok(Bytes::from(vec![DIGITAL_MESSAGE + port, lsb, msb]))
}

/// Frame: write an analog-style value (PWM duty or servo angle) to a pin
pub fn analog_write(pin: u8, value: u16) -> Result<Bytes> {
    let [lsb, msb] = encode_u14(value)?;
    Ok(Bytes::from(vec![ANALOG_MESSAGE + pin, lsb, msb]))
}

/// Frame: configure a servo's pulse-width bounds
pub fn servo_config(pin: u8, min_pulse: u16, max_pulse: u16) -> Result<Bytes> {
    let mut payload = Vec::with_capacity(5);
    payload.push(pin);
    payload.extend_from_slice(&encode_u14(min_pulse)?);
    payload.extend_from_slice(&encode_u14(max_pulse)?);
    Ok(sysex(SERVO_CONFIG, &payload))
}

/// Frame: set the device-side sampling interval in milliseconds
pub fn sampling_interval(ms: u16) -> Result<Bytes> {
    let payload = encode_u14(ms)?;
    Ok(sysex(SAMPLING_INTERVAL, &payload))
}

/// Frame: query per-pin capabilities
pub fn capability_query() -> Bytes {
    sysex(CAPABILITY_QUERY, &[])
}

/// Frame: query firmware version and name
pub fn firmware_query() -> Bytes {
    sysex(REPORT_FIRMWARE, &[])
}

/// Frame: reset the device to its power-up state
pub fn system_reset() -> Bytes {
    Bytes::from(vec![SYSTEM_RESET])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u14_round_trip() {
        for value in 0..=U14_MAX {
            let [lsb, msb] = encode_u14(value).unwrap();
            assert!(lsb < 0x80 && msb < 0x80);
            assert_eq!(decode_u14(lsb, msb), value);
        }
    }

    #[test]
    fn test_u14_rejects_out_of_range() {
        assert!(matches!(
            encode_u14(U14_MAX + 1),
            Err(BoardError::ValueOutOfRange(_))
        ));
        assert!(encode_u14(u16::MAX).is_err());
    }

    #[test]
    fn test_decode_u14_known_value() {
        // low=0x7F, high=0x03 -> (3 << 7) | 127 = 511
        assert_eq!(decode_u14(0x7F, 0x03), 511);
    }

    #[test]
    fn test_decode_7bit_string() {
        // "Arm" as two bytes per character
        let data = [b'A', 0, b'r', 0, b'm', 0];
        assert_eq!(decode_7bit_string(&data), "Arm");
        // Odd trailing byte decodes with an implicit zero high byte
        assert_eq!(decode_7bit_string(&[b'A']), "A");
        assert_eq!(decode_7bit_string(&[]), "");
    }

    #[test]
    fn test_sysex_framing() {
        let frame = sysex(CAPABILITY_QUERY, &[]);
        assert_eq!(frame.as_ref(), &[START_SYSEX, CAPABILITY_QUERY, END_SYSEX]);

        let frame = sysex(SERVO_CONFIG, &[9, 0x20, 0x04]);
        assert_eq!(frame[0], START_SYSEX);
        assert_eq!(*frame.last().unwrap(), END_SYSEX);
        assert_eq!(&frame[2..frame.len() - 1], &[9, 0x20, 0x04]);
    }

    #[test]
    fn test_frame_builders() {
        assert_eq!(set_pin_mode(13, 1).as_ref(), &[SET_PIN_MODE, 13, 1]);
        assert_eq!(report_analog(2, true).as_ref(), &[0xC2, 1]);
        assert_eq!(report_digital(1, false).as_ref(), &[0xD1, 0]);
        assert_eq!(digital_port_write(0, 0xFF).unwrap().as_ref(), &[0x90, 0x7F, 0x01]);
        assert_eq!(analog_write(9, 128).unwrap().as_ref(), &[0xE9, 0x00, 0x01]);
        assert_eq!(system_reset().as_ref(), &[SYSTEM_RESET]);
    }

    #[test]
    fn test_servo_config_frame() {
        let frame = servo_config(3, SERVO_MIN_PULSE, SERVO_MAX_PULSE).unwrap();
        // 544 = [0x20, 0x04], 2400 = [0x60, 0x12]
        assert_eq!(
            frame.as_ref(),
            &[START_SYSEX, SERVO_CONFIG, 3, 0x20, 0x04, 0x60, 0x12, END_SYSEX]
        );
    }

    #[test]
    fn test_sampling_interval_frame() {
        let frame = sampling_interval(19).unwrap();
        assert_eq!(
            frame.as_ref(),
            &[START_SYSEX, SAMPLING_INTERVAL, 19, 0, END_SYSEX]
        );
    }
}
