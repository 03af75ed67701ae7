/*!
 * Board pin layouts and capability parsing.
 *
 * A [`Layout`] names which pin indices are digital, analog, PWM-capable,
 * servo-capable, or disabled. It is either supplied by the caller (directly
 * or by name from configuration) or derived from the device's capability
 * response during discovery.
 */
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::pin::{Pin, PinMode, Port, PortSlot};
use crate::protocol::CAPABILITY_SENTINEL;

/// Capability mode code: digital input
const CAP_INPUT: u8 = 0;
/// Capability mode code: digital output
const CAP_OUTPUT: u8 = 1;
/// Capability mode code: analog input
const CAP_ANALOG: u8 = 2;
/// Capability mode code: PWM output
const CAP_PWM: u8 = 3;
/// Capability mode code: servo output
const CAP_SERVO: u8 = 4;

/// The derived or supplied mapping of pin indices to capability categories
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Layout {
    /// Digital pin indices
    pub digital: Vec<u8>,
    /// Analog pin indices; the wire channel of each is its position here
    #[serde(default)]
    pub analog: Vec<u8>,
    /// PWM-capable digital indices
    #[serde(default)]
    pub pwm: Vec<u8>,
    /// Servo-capable digital indices
    #[serde(default)]
    pub servo: Vec<u8>,
    /// Digital indices that can never be used
    #[serde(default)]
    pub disabled: Vec<u8>,
}

impl Layout {
    /// The classic Uno-style layout: 14 digital pins, 6 analog channels,
    /// hardware serial on pins 0 and 1
    pub fn uno() -> Self {
        Self {
            digital: (0..=13).collect(),
            analog: (0..=5).collect(),
            pwm: vec![3, 5, 6, 9, 10, 11],
            servo: (2..=13).collect(),
            disabled: vec![0, 1],
        }
    }

    /// The Mega-style layout: 54 digital pins, 16 analog channels
    pub fn mega() -> Self {
        let mut pwm: Vec<u8> = (2..=13).collect();
        pwm.extend(44..=46);
        Self {
            digital: (0..=53).collect(),
            analog: (0..=15).collect(),
            pwm,
            servo: (2..=53).collect(),
            disabled: vec![0, 1],
        }
    }

    /// Look up a built-in layout by name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "uno" | "arduino" => Some(Self::uno()),
            "mega" | "arduino_mega" => Some(Self::mega()),
            _ => None,
        }
    }

    /// Reduce per-pin capability records into a layout.
    ///
    /// Record `i` describes pin index `i`. An empty record marks the pin
    /// disabled. Mode codes 0 and 1 mark a pin digital, 2 analog, 3
    /// PWM-capable, 4 servo-capable; duplicate codes within one record are
    /// de-duplicated. A pin that reports analog capability is classified
    /// analog and excluded from the digital index set.
    pub fn from_capabilities(records: &[Vec<u8>]) -> Self {
        let mut digital = BTreeSet::new();
        let mut analog = BTreeSet::new();
        let mut pwm = BTreeSet::new();
        let mut servo = BTreeSet::new();
        let mut disabled = BTreeSet::new();

        for (index, record) in records.iter().enumerate() {
            let index = index as u8;
            if record.is_empty() {
                digital.insert(index);
                disabled.insert(index);
                continue;
            }
            for pair in record.chunks(2) {
                match pair[0] {
                    CAP_INPUT | CAP_OUTPUT => {
                        digital.insert(index);
                    }
                    CAP_ANALOG => {
                        analog.insert(index);
                    }
                    CAP_PWM => {
                        pwm.insert(index);
                    }
                    CAP_SERVO => {
                        servo.insert(index);
                    }
                    _ => {}
                }
            }
        }

        let digital: Vec<u8> = digital.difference(&analog).copied().collect();
        let keep = |set: BTreeSet<u8>| -> Vec<u8> {
            set.into_iter().filter(|i| digital.contains(i)).collect()
        };
        let pwm = keep(pwm);
        let servo = keep(servo);
        Self {
            digital,
            analog: analog.into_iter().collect(),
            pwm,
            servo,
            disabled: disabled.into_iter().collect(),
        }
    }

    /// Whether the layout describes at least one usable pin
    pub fn is_usable(&self) -> bool {
        !self.digital.is_empty() || !self.analog.is_empty()
    }

    /// Instantiate the pin and port collections this layout describes.
    ///
    /// Digital pins are grouped into 8-wide report ports by absolute index;
    /// each pin's `(port, offset)` slot is derived here, once, and stored.
    pub(crate) fn instantiate(&self) -> (Vec<Pin>, Vec<Pin>, Vec<Port>) {
        let mut digital: Vec<Pin> = Vec::with_capacity(self.digital.len());
        let mut ports: Vec<Port> = Vec::new();

        let mut indices = self.digital.clone();
        indices.sort_unstable();
        for index in indices {
            let slot = PortSlot {
                port: index / 8,
                offset: index % 8,
            };
            let mut pin = Pin::digital(index, slot);
            pin.pwm_capable = self.pwm.contains(&index);
            if self.disabled.contains(&index) {
                pin.mode = PinMode::Unavailable;
            }
            match ports.iter().position(|p| p.index == slot.port) {
                Some(pos) => ports[pos].pins.push(index),
                None => ports.push(Port::new(slot.port, vec![index])),
            }
            digital.push(pin);
        }

        let analog: Vec<Pin> = self
            .analog
            .iter()
            .enumerate()
            .map(|(channel, &index)| Pin::analog(index, channel as u8))
            .collect();

        (digital, analog, ports)
    }
}

/// Split a capability-response payload into per-pin records.
///
/// Each pin's record is terminated by the sentinel byte; the sentinel itself
/// is not part of the record. Trailing bytes after the last sentinel are
/// ignored.
pub fn split_capability_records(payload: &[u8]) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    let mut current = Vec::new();
    for &byte in payload {
        if byte == CAPABILITY_SENTINEL {
            records.push(std::mem::take(&mut current));
        } else {
            current.push(byte);
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pin::PinKind;

    #[test]
    fn test_uno_layout() {
        let layout = Layout::uno();
        assert_eq!(layout.digital.len(), 14);
        assert_eq!(layout.analog.len(), 6);
        assert!(layout.pwm.contains(&9));
        assert!(layout.disabled.contains(&0));
        assert!(layout.is_usable());
    }

    #[test]
    fn test_by_name() {
        assert_eq!(Layout::by_name("uno"), Some(Layout::uno()));
        assert_eq!(Layout::by_name("mega"), Some(Layout::mega()));
        assert_eq!(Layout::by_name("teensy"), None);
    }

    #[test]
    fn test_split_capability_records() {
        let payload = [0, 1, 1, 1, 0x7F, 0x7F, 2, 10, 0x7F];
        let records = split_capability_records(&payload);
        assert_eq!(records, vec![vec![0, 1, 1, 1], vec![], vec![2, 10]]);
    }

    #[test]
    fn test_digital_capability_record() {
        // A pin reporting input and output capability lands in the digital
        // set, not analog.
        let records = vec![vec![0, 1, 1, 1]];
        let layout = Layout::from_capabilities(&records);
        assert_eq!(layout.digital, vec![0]);
        assert!(layout.analog.is_empty());
        assert!(layout.disabled.is_empty());
    }

    #[test]
    fn test_capability_classification() {
        let records = vec![
            vec![0, 1, 1, 1],             // pin 0: digital
            vec![0, 1, 1, 1, 3, 8],       // pin 1: digital + pwm
            vec![0, 1, 1, 1, 4, 14],      // pin 2: digital + servo
            vec![],                       // pin 3: disabled
            vec![0, 1, 1, 1, 2, 10],      // pin 4: analog (digital excluded)
            vec![2, 10, 2, 10],           // pin 5: analog, duplicated record
        ];
        let layout = Layout::from_capabilities(&records);
        assert_eq!(layout.digital, vec![0, 1, 2, 3]);
        assert_eq!(layout.analog, vec![4, 5]);
        assert_eq!(layout.pwm, vec![1]);
        assert_eq!(layout.servo, vec![2]);
        assert_eq!(layout.disabled, vec![3]);
    }

    #[test]
    fn test_instantiate_groups_ports() {
        let layout = Layout::uno();
        let (digital, analog, ports) = layout.instantiate();
        assert_eq!(digital.len(), 14);
        assert_eq!(analog.len(), 6);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].pins.len(), 8);
        assert_eq!(ports[1].pins.len(), 6);

        // Two-level addressing is derived once and stored
        let pin13 = digital.iter().find(|p| p.index == 13).unwrap();
        assert_eq!(pin13.slot, Some(PortSlot { port: 1, offset: 5 }));

        // Serial pins are unavailable, PWM flags follow the layout
        assert_eq!(digital[0].mode, PinMode::Unavailable);
        assert!(digital.iter().find(|p| p.index == 9).unwrap().pwm_capable);
        assert!(!digital.iter().find(|p| p.index == 8).unwrap().pwm_capable);

        // Analog channels follow list position
        assert_eq!(analog[2].kind, PinKind::Analog);
        assert_eq!(analog[2].channel, Some(2));
    }

    #[test]
    fn test_layout_from_toml() {
        let layout: Layout = toml::from_str(
            r#"
            digital = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13]
            analog = [14, 15, 16, 17, 18, 19]
            pwm = [3, 5, 6, 9, 10, 11]
        "#,
        )
        .unwrap();
        assert_eq!(layout.digital.len(), 14);
        assert_eq!(layout.analog, vec![14, 15, 16, 17, 18, 19]);
        assert!(layout.servo.is_empty());
        assert!(layout.disabled.is_empty());

        // Analog wire channels are positional even when indices are offset
        let (_, analog, _) = layout.instantiate();
        assert_eq!(analog[0].index, 14);
        assert_eq!(analog[0].channel, Some(0));
    }
}
