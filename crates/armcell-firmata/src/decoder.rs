/*!
 * Byte-stream frame reassembly.
 *
 * The decoder consumes the transport's bytes one at a time and emits a
 * [`Message`] whenever a complete frame has been collected. It understands
 * the two framing modes of the wire protocol: fixed-length status messages,
 * whose arity comes from the closed command table, and extended messages
 * delimited by the sysex start and end markers.
 */
use tracing::{trace, warn};

use crate::command::{Message, StatusKind, SysexKind};
use crate::protocol;

#[derive(Debug)]
enum DecoderState {
    /// Waiting for a leading byte
    Idle,
    /// Collecting the fixed payload of a status command
    Status {
        kind: StatusKind,
        nibble: Option<u8>,
        buf: Vec<u8>,
    },
    /// Start marker seen, waiting for the sysex command byte
    SysexCommand,
    /// Collecting sysex payload until the end marker
    SysexPayload { kind: SysexKind, buf: Vec<u8> },
}

/// Reassembles discrete protocol messages from a byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecoderState,
}

impl FrameDecoder {
    /// Create a decoder in the idle state
    pub fn new() -> Self {
        Self {
            state: DecoderState::Idle,
        }
    }

    /// Consume one byte; returns a message when it completes a frame.
    ///
    /// Unknown leading bytes are dropped. Their arity is unknowable, so the
    /// decoder cannot tell where the orphaned frame ends; if such a byte
    /// starts a real multi-byte frame the stream stays misaligned until the
    /// next recognizable boundary. The protocol offers no way to resync, and
    /// guessing risks consuming bytes that belong to a valid frame, so none
    /// is attempted.
    pub fn feed(&mut self, byte: u8) -> Option<Message> {
        match &mut self.state {
            DecoderState::Idle => {
                if byte == protocol::START_SYSEX {
                    self.state = DecoderState::SysexCommand;
                    return None;
                }
                match StatusKind::classify(byte) {
                    Some((kind, nibble)) => {
                        self.state = DecoderState::Status {
                            kind,
                            nibble,
                            buf: Vec::with_capacity(kind.arity()),
                        };
                    }
                    None => {
                        warn!(
                            "unknown command byte {:#04x}, dropping (stream may be misaligned)",
                            byte
                        );
                    }
                }
                None
            }
            DecoderState::Status { kind, nibble, buf } => {
                buf.push(byte);
                if buf.len() == kind.arity() {
                    let msg = Message::from_status(*kind, *nibble, buf);
                    trace!(?msg, "frame complete");
                    self.state = DecoderState::Idle;
                    return Some(msg);
                }
                None
            }
            DecoderState::SysexCommand => {
                self.state = DecoderState::SysexPayload {
                    kind: SysexKind::from_byte(byte),
                    buf: Vec::new(),
                };
                None
            }
            DecoderState::SysexPayload { kind, buf } => {
                if byte == protocol::END_SYSEX {
                    let msg = Message::Sysex {
                        kind: *kind,
                        payload: std::mem::take(buf),
                    };
                    trace!(?msg, "sysex frame complete");
                    self.state = DecoderState::Idle;
                    return Some(msg);
                }
                buf.push(byte);
                None
            }
        }
    }

    /// Feed a slice of bytes, collecting every completed message
    pub fn feed_all(&mut self, bytes: &[u8]) -> Vec<Message> {
        bytes.iter().filter_map(|&b| self.feed(b)).collect()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{END_SYSEX, START_SYSEX};

    #[test]
    fn test_analog_report() {
        let mut decoder = FrameDecoder::new();
        assert_eq!(decoder.feed(0xE4), None);
        assert_eq!(decoder.feed(0x7F), None);
        let msg = decoder.feed(0x03).unwrap();
        assert_eq!(
            msg,
            Message::Analog {
                channel: 4,
                lsb: 0x7F,
                msb: 0x03
            }
        );
    }

    #[test]
    fn test_digital_report() {
        let mut decoder = FrameDecoder::new();
        let msgs = decoder.feed_all(&[0x91, 0x05, 0x01]);
        assert_eq!(
            msgs,
            vec![Message::DigitalPort {
                port: 1,
                lsb: 0x05,
                msb: 0x01
            }]
        );
    }

    #[test]
    fn test_protocol_version() {
        let mut decoder = FrameDecoder::new();
        let msgs = decoder.feed_all(&[0xF9, 2, 5]);
        assert_eq!(msgs, vec![Message::ProtocolVersion { major: 2, minor: 5 }]);
    }

    #[test]
    fn test_sysex_payload_bounds() {
        // One well-formed extended message produces exactly one frame whose
        // payload is the bytes strictly between the markers.
        let mut decoder = FrameDecoder::new();
        let bytes = [START_SYSEX, 0x71, b'h', 0, b'i', 0, END_SYSEX];
        let msgs = decoder.feed_all(&bytes);
        assert_eq!(msgs.len(), 1);
        assert_eq!(
            msgs[0],
            Message::Sysex {
                kind: SysexKind::StringData,
                payload: vec![b'h', 0, b'i', 0],
            }
        );
    }

    #[test]
    fn test_empty_sysex() {
        let mut decoder = FrameDecoder::new();
        let msgs = decoder.feed_all(&[START_SYSEX, 0x6C, END_SYSEX]);
        assert_eq!(
            msgs,
            vec![Message::Sysex {
                kind: SysexKind::CapabilityResponse,
                payload: vec![],
            }]
        );
    }

    #[test]
    fn test_unknown_sysex_collected_until_end_marker() {
        let mut decoder = FrameDecoder::new();
        let msgs = decoder.feed_all(&[START_SYSEX, 0x42, 1, 2, 3, END_SYSEX, 0xF9, 2, 5]);
        // The unknown sysex surfaces as Unknown (the dispatcher drops it);
        // the stream stays aligned for the next frame.
        assert_eq!(msgs.len(), 2);
        assert_eq!(
            msgs[0],
            Message::Sysex {
                kind: SysexKind::Unknown(0x42),
                payload: vec![1, 2, 3],
            }
        );
        assert_eq!(msgs[1], Message::ProtocolVersion { major: 2, minor: 5 });
    }

    #[test]
    fn test_unknown_status_byte_dropped() {
        let mut decoder = FrameDecoder::new();
        // 0xA3 has no registration; the decoder drops it and picks up the
        // following frame, which here starts at a clean boundary.
        let msgs = decoder.feed_all(&[0xA3, 0xE0, 0x10, 0x00]);
        assert_eq!(
            msgs,
            vec![Message::Analog {
                channel: 0,
                lsb: 0x10,
                msb: 0x00
            }]
        );
    }

    #[test]
    fn test_messages_emitted_in_arrival_order() {
        let mut decoder = FrameDecoder::new();
        let mut bytes = vec![0xE0, 1, 0];
        bytes.extend_from_slice(&[0x90, 2, 0]);
        bytes.extend_from_slice(&[0xE1, 3, 0]);
        let msgs = decoder.feed_all(&bytes);
        assert_eq!(msgs.len(), 3);
        assert!(matches!(msgs[0], Message::Analog { channel: 0, .. }));
        assert!(matches!(msgs[1], Message::DigitalPort { port: 0, .. }));
        assert!(matches!(msgs[2], Message::Analog { channel: 1, .. }));
    }

    #[test]
    fn test_byte_at_a_time_equals_batch() {
        let bytes = [START_SYSEX, 0x79, 2, 5, b'f', 0, END_SYSEX, 0xF9, 2, 5];
        let mut one = FrameDecoder::new();
        let mut collected = Vec::new();
        for &b in &bytes {
            if let Some(m) = one.feed(b) {
                collected.push(m);
            }
        }
        let mut batch = FrameDecoder::new();
        assert_eq!(collected, batch.feed_all(&bytes));
    }
}
