/*!
 * The board controller.
 *
 * A [`Board`] owns the transport, the frame decoder pipeline, the pin and
 * port collections, and the background poller. It runs the capability
 * handshake when no layout is supplied, lends pins to callers as
 * [`PinHandle`]s, and publishes [`BoardEvent`]s for every state change
 * learned from the device.
 *
 * All shared state sits behind one mutex; acquire, release, and write are
 * the only mutation entry points, so the "taken by at most one owner"
 * invariant is checkable in one place. Lock order, for anything that takes
 * more than one: dispatcher, then state, then transport.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use armcell_core::config::BoardConfig;
use armcell_core::error::Error as CoreError;
use armcell_core::types::Id;

use crate::command::{Message, MessageKind, SysexKind};
use crate::decoder::FrameDecoder;
use crate::discovery;
use crate::dispatch::{Dispatcher, Notification};
use crate::error::{BoardError, Result};
use crate::layout::{split_capability_records, Layout};
use crate::pin::{parse_pin_spec, Pin, PinAddress, PinKind, PinMode, PinValue, Port};
use crate::poller::Poller;
use crate::protocol;
use crate::transport::{SerialTransport, Transport};

/// Capacity of the board event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How often discovery re-checks for an established layout
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Board session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not yet opened
    Unopened,
    /// Capability query sent, waiting for the response
    AwaitingCapability,
    /// Layout established, pins instantiated
    Configured,
    /// Pins may be acquired, released, and written
    Running,
    /// Session torn down; terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unopened => "unopened",
            SessionState::AwaitingCapability => "awaiting-capability",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

/// Firmware identification reported by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Firmware name
    pub name: String,
}

/// Events published by a board session
#[derive(Debug, Clone)]
pub enum BoardEvent {
    /// A pin's value changed, by device report or local write
    PinChanged {
        /// The pin's address
        address: PinAddress,
        /// The new value
        value: PinValue,
        /// When the change was observed
        at: DateTime<Utc>,
    },
    /// The device reported its protocol version
    ProtocolVersion {
        /// Major version
        major: u8,
        /// Minor version
        minor: u8,
    },
    /// The device reported its firmware identification
    FirmwareReport {
        /// The reported firmware
        firmware: FirmwareInfo,
    },
    /// The background poller terminated
    PollerStopped {
        /// Why the poller stopped
        reason: String,
    },
}

/// The board's shared mutable state: pins, ports, ownership, and session
/// metadata. Handlers mutate it under the board's state lock.
pub struct BoardState {
    pub(crate) session: SessionState,
    pub(crate) digital: Vec<Pin>,
    pub(crate) analog: Vec<Pin>,
    pub(crate) ports: Vec<Port>,
    pub(crate) taken: HashMap<PinAddress, bool>,
    pub(crate) layout: Option<Layout>,
    pub(crate) protocol_version: Option<(u8, u8)>,
    pub(crate) firmware: Option<FirmwareInfo>,
    pub(crate) events: broadcast::Sender<BoardEvent>,
}

impl BoardState {
    fn new(events: broadcast::Sender<BoardEvent>) -> Self {
        Self {
            session: SessionState::Unopened,
            digital: Vec::new(),
            analog: Vec::new(),
            ports: Vec::new(),
            taken: HashMap::new(),
            layout: None,
            protocol_version: None,
            firmware: None,
            events,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = Self::new(events);
        state.session = SessionState::Running;
        state
    }

    fn ensure_running(&self) -> Result<()> {
        if self.session != SessionState::Running {
            return Err(BoardError::not_ready(format!(
                "session state is {}",
                self.session
            )));
        }
        Ok(())
    }

    fn publish(&self, event: BoardEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn pin(&self, address: PinAddress) -> Option<&Pin> {
        let pins = match address.kind {
            PinKind::Digital => &self.digital,
            PinKind::Analog => &self.analog,
        };
        pins.iter().find(|p| p.index == address.index)
    }

    fn pin_mut(&mut self, address: PinAddress) -> Option<&mut Pin> {
        let pins = match address.kind {
            PinKind::Digital => &mut self.digital,
            PinKind::Analog => &mut self.analog,
        };
        pins.iter_mut().find(|p| p.index == address.index)
    }

    fn digital_pin_mut(&mut self, index: u8) -> Option<&mut Pin> {
        self.digital.iter_mut().find(|p| p.index == index)
    }

    fn analog_pin_by_channel_mut(&mut self, channel: u8) -> Option<&mut Pin> {
        self.analog.iter_mut().find(|p| p.channel == Some(channel))
    }

    fn port(&self, index: u8) -> Option<&Port> {
        self.ports.iter().find(|p| p.index == index)
    }

    fn port_mut(&mut self, index: u8) -> Option<&mut Port> {
        self.ports.iter_mut().find(|p| p.index == index)
    }

    /// Recompute the output bitmask of a whole port from its pins' values
    fn port_output_mask(&self, port_index: u8) -> u16 {
        let mut mask = 0u16;
        if let Some(port) = self.port(port_index) {
            for &index in &port.pins {
                if let Some(pin) = self.digital.iter().find(|p| p.index == index) {
                    if pin.mode == PinMode::Output
                        && pin.value == Some(PinValue::Digital(true))
                    {
                        if let Some(slot) = pin.slot {
                            mask |= 1 << slot.offset;
                        }
                    }
                }
            }
        }
        mask
    }

    /// Apply a received port bitmask to every input-mode member pin.
    ///
    /// The new values are computed for the whole port before any pin is
    /// mutated, so a report is applied completely or not at all.
    pub(crate) fn apply_port_mask(
        &mut self,
        port_index: u8,
        mask: u16,
    ) -> Result<Vec<Notification>> {
        let port = self.port(port_index).ok_or_else(|| {
            BoardError::malformed(format!("digital report for unknown port {}", port_index))
        })?;
        if !port.reporting {
            return Ok(Vec::new());
        }

        let members = port.pins.clone();
        let mut updates = Vec::new();
        for index in members {
            if let Some(pin) = self.digital.iter().find(|p| p.index == index) {
                if pin.mode.is_input() {
                    if let Some(slot) = pin.slot {
                        updates.push((index, mask & (1 << slot.offset) != 0));
                    }
                }
            }
        }

        let mut notifications = Vec::new();
        for (index, level) in updates {
            let value = PinValue::Digital(level);
            let entry = self.digital_pin_mut(index).map(|pin| {
                pin.value = Some(value);
                (pin.address(), pin.callback.clone())
            });
            if let Some((address, callback)) = entry {
                self.publish(BoardEvent::PinChanged {
                    address,
                    value,
                    at: Utc::now(),
                });
                if let Some(callback) = callback {
                    notifications.push(Notification { callback, value });
                }
            }
        }
        Ok(notifications)
    }

    /// Check that `mode` is valid for the pin, without mutating anything
    fn validate_mode(pin: &Pin, mode: PinMode) -> Result<()> {
        let address = pin.address();
        if pin.mode == PinMode::Unavailable {
            return Err(BoardError::Disabled(address));
        }
        match (pin.kind, mode) {
            (_, PinMode::Unavailable) => Err(BoardError::unsupported(format!(
                "pin {} cannot be marked unavailable after construction",
                address
            ))),
            (PinKind::Analog, PinMode::Input) => Ok(()),
            (PinKind::Analog, _) => Err(BoardError::unsupported(format!(
                "pin {} is an analog input and cannot drive {}",
                address, mode
            ))),
            (PinKind::Digital, PinMode::Pwm) if !pin.pwm_capable => Err(
                BoardError::unsupported(format!("pin {} has no PWM capability", address)),
            ),
            (PinKind::Digital, _) => Ok(()),
        }
    }

    /// Set a pin's mode, returning the frames to put on the wire.
    ///
    /// Inputs enable reporting (digital pins through their port); servo mode
    /// issues the pulse-width configuration and an initial angle of zero.
    fn apply_mode(
        &mut self,
        address: PinAddress,
        mode: PinMode,
        servo_bounds: (u16, u16),
    ) -> Result<Vec<Bytes>> {
        let (kind, channel, slot) = {
            let pin = self
                .pin(address)
                .ok_or(BoardError::InvalidIndex(address))?;
            Self::validate_mode(pin, mode)?;
            (pin.kind, pin.channel, pin.slot)
        };

        let mut frames = Vec::new();
        match (kind, mode) {
            (PinKind::Analog, _) => {
                let channel = channel.unwrap_or(address.index);
                frames.push(protocol::report_analog(channel, true));
                if let Some(pin) = self.pin_mut(address) {
                    pin.reporting = true;
                }
            }
            (PinKind::Digital, PinMode::Servo) => {
                let (min_pulse, max_pulse) = servo_bounds;
                frames.push(protocol::servo_config(address.index, min_pulse, max_pulse)?);
                frames.push(protocol::analog_write(address.index, 0)?);
                if let Some(pin) = self.pin_mut(address) {
                    pin.mode = PinMode::Servo;
                    pin.reporting = false;
                    pin.value = Some(PinValue::Angle(0));
                }
            }
            (PinKind::Digital, mode) => {
                let code = mode.wire_code().ok_or_else(|| {
                    BoardError::unsupported(format!("mode {} has no wire code", mode))
                })?;
                frames.push(protocol::set_pin_mode(address.index, code));
                if let Some(pin) = self.pin_mut(address) {
                    pin.mode = mode;
                    pin.reporting = false;
                }
                if mode.is_input() {
                    if let Some(slot) = slot {
                        if let Some(port) = self.port_mut(slot.port) {
                            if !port.reporting {
                                port.reporting = true;
                                frames.push(protocol::report_digital(slot.port, true));
                            }
                            let members = port.pins.clone();
                            for index in members {
                                if let Some(p) = self.digital_pin_mut(index) {
                                    if p.mode.is_input() {
                                        p.reporting = true;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(frames)
    }

    /// Frames that disable every enabled report and return servo pins to
    /// output mode, for session teardown
    fn teardown_frames(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        for pin in &mut self.analog {
            if pin.reporting {
                pin.reporting = false;
                if let Some(channel) = pin.channel {
                    frames.push(protocol::report_analog(channel, false));
                }
            }
        }
        for port in &mut self.ports {
            if port.reporting {
                port.reporting = false;
                frames.push(protocol::report_digital(port.index, false));
            }
        }
        for pin in &mut self.digital {
            pin.reporting = false;
            if pin.mode == PinMode::Servo {
                pin.mode = PinMode::Output;
                if let Some(code) = PinMode::Output.wire_code() {
                    frames.push(protocol::set_pin_mode(pin.index, code));
                }
            }
        }
        frames
    }
}

impl fmt::Debug for BoardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoardState")
            .field("session", &self.session)
            .field("digital", &self.digital.len())
            .field("analog", &self.analog.len())
            .field("ports", &self.ports.len())
            .field("protocol_version", &self.protocol_version)
            .field("firmware", &self.firmware)
            .finish()
    }
}

/// State shared between the board, its pin handles, and the poller
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<BoardState>,
    pub(crate) transport: Mutex<Box<dyn Transport>>,
    pub(crate) dispatcher: Mutex<Dispatcher>,
}

impl Shared {
    /// Drain every currently available byte through the decoder and
    /// dispatcher; returns how many bytes were processed.
    pub(crate) fn drain(&self, decoder: &mut FrameDecoder) -> Result<usize> {
        let bytes = {
            let mut transport = self.transport.lock().unwrap();
            let available = transport.bytes_available()?;
            if available == 0 {
                return Ok(0);
            }
            let mut buf = vec![0u8; available];
            transport.read_exact(&mut buf)?;
            buf
        };

        for &byte in &bytes {
            if let Some(message) = decoder.feed(byte) {
                let notifications = {
                    let mut dispatcher = self.dispatcher.lock().unwrap();
                    let mut state = self.state.lock().unwrap();
                    dispatcher.dispatch(&mut state, message)
                };
                // Callbacks run outside the state lock
                for notification in notifications {
                    (notification.callback)(notification.value);
                }
            }
        }
        Ok(bytes.len())
    }

    /// Mark the session closed after a channel fault
    pub(crate) fn mark_closed(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.session = SessionState::Closed;
        state.publish(BoardEvent::PollerStopped {
            reason: reason.to_string(),
        });
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn handle_analog(state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    let (channel, lsb, msb) = match message {
        Message::Analog { channel, lsb, msb } => (channel, lsb, msb),
        _ => return Ok(Vec::new()),
    };
    let raw = protocol::decode_u14(lsb, msb);
    let value = PinValue::Analog(round4(f64::from(raw) / protocol::ANALOG_FULL_SCALE));
    let entry = match state.analog_pin_by_channel_mut(channel) {
        Some(pin) if pin.reporting => {
            pin.value = Some(value);
            (pin.address(), pin.callback.clone())
        }
        Some(_) => return Ok(Vec::new()),
        None => {
            return Err(BoardError::malformed(format!(
                "analog report for unknown channel {}",
                channel
            )))
        }
    };
    let (address, callback) = entry;
    state.publish(BoardEvent::PinChanged {
        address,
        value,
        at: Utc::now(),
    });
    Ok(callback
        .map(|callback| Notification { callback, value })
        .into_iter()
        .collect())
}

fn handle_digital_port(state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    let (port, lsb, msb) = match message {
        Message::DigitalPort { port, lsb, msb } => (port, lsb, msb),
        _ => return Ok(Vec::new()),
    };
    state.apply_port_mask(port, protocol::decode_u14(lsb, msb))
}

fn handle_protocol_version(state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    if let Message::ProtocolVersion { major, minor } = message {
        debug!(major, minor, "protocol version reported");
        state.protocol_version = Some((major, minor));
        state.publish(BoardEvent::ProtocolVersion { major, minor });
    }
    Ok(Vec::new())
}

fn handle_firmware(state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    let payload = match message {
        Message::Sysex { payload, .. } => payload,
        _ => return Ok(Vec::new()),
    };
    if payload.len() < 2 {
        return Err(BoardError::malformed(
            "firmware report shorter than its version header",
        ));
    }
    let firmware = FirmwareInfo {
        major: payload[0],
        minor: payload[1],
        name: protocol::decode_7bit_string(&payload[2..]),
    };
    info!(name = %firmware.name, major = firmware.major, minor = firmware.minor, "firmware reported");
    state.firmware = Some(firmware.clone());
    state.publish(BoardEvent::FirmwareReport { firmware });
    Ok(Vec::new())
}

fn handle_string_data(_state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    if let Message::Sysex { payload, .. } = message {
        let text = protocol::decode_7bit_string(&payload);
        info!(%text, "device message");
    }
    Ok(Vec::new())
}

fn handle_capability(state: &mut BoardState, message: Message) -> Result<Vec<Notification>> {
    let payload = match message {
        Message::Sysex { payload, .. } => payload,
        _ => return Ok(Vec::new()),
    };
    let records = split_capability_records(&payload);
    let layout = Layout::from_capabilities(&records);
    if layout.is_usable() {
        debug!(
            digital = layout.digital.len(),
            analog = layout.analog.len(),
            "capability response reduced to a layout"
        );
        state.layout = Some(layout);
    } else {
        warn!("capability response described no usable pins");
    }
    Ok(Vec::new())
}

fn install_default_handlers(dispatcher: &mut Dispatcher) {
    dispatcher.register(MessageKind::Analog, Box::new(handle_analog));
    dispatcher.register(MessageKind::DigitalPort, Box::new(handle_digital_port));
    dispatcher.register(
        MessageKind::ProtocolVersion,
        Box::new(handle_protocol_version),
    );
    dispatcher.register(
        MessageKind::Sysex(SysexKind::FirmwareReport),
        Box::new(handle_firmware),
    );
    dispatcher.register(
        MessageKind::Sysex(SysexKind::StringData),
        Box::new(handle_string_data),
    );
}

/// Builder for opening a board session
#[derive(Debug, Clone)]
pub struct BoardBuilder {
    port: Option<String>,
    baud_rate: u32,
    name: Option<String>,
    layout: Option<Layout>,
    settle_delay: Duration,
    discovery_timeout: Duration,
    sampling_interval: Duration,
}

impl Default for BoardBuilder {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 57600,
            name: None,
            layout: None,
            settle_delay: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(3),
            sampling_interval: Duration::from_millis(19),
        }
    }
}

impl BoardBuilder {
    /// Create a builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from a board configuration section
    pub fn from_config(config: &BoardConfig) -> Result<Self> {
        let mut builder = Self::new()
            .with_baud_rate(config.baud_rate)
            .with_settle_delay(Duration::from_millis(config.settle_delay_ms))
            .with_discovery_timeout(Duration::from_millis(config.discovery_timeout_ms))
            .with_sampling_interval(Duration::from_millis(config.sampling_interval_ms));
        if let Some(port) = &config.port {
            builder = builder.with_port(port);
        }
        if let Some(name) = &config.layout {
            let layout = Layout::by_name(name).ok_or_else(|| {
                BoardError::Core(CoreError::config(format!("unknown layout '{}'", name)))
            })?;
            builder = builder.with_layout(layout);
        }
        Ok(builder)
    }

    /// Set the serial port path; auto-detected when absent
    pub fn with_port<S: AsRef<str>>(mut self, port: S) -> Self {
        self.port = Some(port.as_ref().to_string());
        self
    }

    /// Set the serial baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the board name used in logs and events
    pub fn with_name<S: AsRef<str>>(mut self, name: S) -> Self {
        self.name = Some(name.as_ref().to_string());
        self
    }

    /// Supply a pin layout, skipping capability auto-detection
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Set the settle delay observed after opening the transport
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set how long capability discovery may run before failing
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the device-side sampling interval requested when polling starts
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Open the serial port and run the session handshake
    pub async fn open(self) -> Result<Board> {
        let port = match &self.port {
            Some(port) => port.clone(),
            None => discovery::detect_port()?,
        };
        let transport = SerialTransport::open(&port, self.baud_rate)?;
        let builder = if self.name.is_none() {
            self.with_name(&port)
        } else {
            self
        };
        builder.open_with_transport(Box::new(transport)).await
    }

    /// Run the session handshake over an already-open transport
    pub async fn open_with_transport(self, transport: Box<dyn Transport>) -> Result<Board> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            state: Mutex::new(BoardState::new(events.clone())),
            transport: Mutex::new(transport),
            dispatcher: Mutex::new(Dispatcher::new()),
        });
        let board = Board {
            id: Id::new(),
            name: self.name.unwrap_or_else(|| "board".to_string()),
            shared,
            events,
            poller: Poller::new(),
            sampling_interval: self.sampling_interval,
        };

        info!(board = %board.name, "opening board session");
        // Devices commonly reset when the serial connection opens; no frame
        // may be sent before the settle delay has passed.
        tokio::time::sleep(self.settle_delay).await;

        match self.layout {
            Some(layout) => board.configure(layout)?,
            None => board.discover_layout(self.discovery_timeout).await?,
        }

        {
            let mut state = board.shared.state.lock().unwrap();
            state.session = SessionState::Running;
        }
        info!(board = %board.name, "board running");
        Ok(board)
    }
}

/// A board session over one serial transport
#[derive(Debug)]
pub struct Board {
    id: Id,
    name: String,
    shared: Arc<Shared>,
    events: broadcast::Sender<BoardEvent>,
    poller: Poller,
    sampling_interval: Duration,
}

impl Board {
    /// Start building a board session
    pub fn builder() -> BoardBuilder {
        BoardBuilder::new()
    }

    /// The session's unique ID
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// The board name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The current session state
    pub fn session_state(&self) -> SessionState {
        self.shared.state.lock().unwrap().session
    }

    /// The established layout, once the session is configured
    pub fn layout(&self) -> Option<Layout> {
        self.shared.state.lock().unwrap().layout.clone()
    }

    /// The protocol version, once reported by the device
    pub fn protocol_version(&self) -> Option<(u8, u8)> {
        self.shared.state.lock().unwrap().protocol_version
    }

    /// The firmware identification, once reported by the device
    pub fn firmware(&self) -> Option<FirmwareInfo> {
        self.shared.state.lock().unwrap().firmware.clone()
    }

    /// Subscribe to board events
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    fn configure(&self, layout: Layout) -> Result<()> {
        if !layout.is_usable() {
            return Err(BoardError::DiscoveryFailed(
                "layout describes no usable pins".to_string(),
            ));
        }
        let (digital, analog, ports) = layout.instantiate();
        {
            let mut dispatcher = self.shared.dispatcher.lock().unwrap();
            install_default_handlers(&mut dispatcher);
        }
        let mut state = self.shared.state.lock().unwrap();
        state.taken = digital
            .iter()
            .chain(analog.iter())
            .map(|pin| (pin.address(), false))
            .collect();
        debug!(
            board = %self.name,
            digital = digital.len(),
            analog = analog.len(),
            ports = ports.len(),
            "board configured"
        );
        state.digital = digital;
        state.analog = analog;
        state.ports = ports;
        state.layout = Some(layout);
        state.session = SessionState::Configured;
        Ok(())
    }

    async fn discover_layout(&self, timeout: Duration) -> Result<()> {
        {
            let mut dispatcher = self.shared.dispatcher.lock().unwrap();
            dispatcher.register(
                MessageKind::Sysex(SysexKind::CapabilityResponse),
                Box::new(handle_capability),
            );
            let mut state = self.shared.state.lock().unwrap();
            state.session = SessionState::AwaitingCapability;
        }
        self.send_frame(&protocol::capability_query())?;
        debug!(board = %self.name, "capability query sent");

        let deadline = Instant::now() + timeout;
        let mut decoder = FrameDecoder::new();
        let layout = loop {
            self.shared.drain(&mut decoder)?;
            let established = self.shared.state.lock().unwrap().layout.clone();
            if let Some(layout) = established {
                break layout;
            }
            if Instant::now() >= deadline {
                self.shared
                    .dispatcher
                    .lock()
                    .unwrap()
                    .unregister(MessageKind::Sysex(SysexKind::CapabilityResponse));
                return Err(BoardError::DiscoveryFailed(format!(
                    "no capability response within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        };
        self.shared
            .dispatcher
            .lock()
            .unwrap()
            .unregister(MessageKind::Sysex(SysexKind::CapabilityResponse));
        self.configure(layout)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.shared.transport.lock().unwrap().write_all(frame)
    }

    /// Acquire a pin for exclusive use, setting its mode.
    ///
    /// Fails with [`BoardError::InvalidIndex`] for an index outside the
    /// layout, [`BoardError::Disabled`] for an unavailable pin, and
    /// [`BoardError::AlreadyOwned`] for a pin another caller holds. A failed
    /// acquisition mutates nothing.
    pub fn acquire(&self, address: PinAddress, mode: PinMode) -> Result<PinHandle> {
        let frames = {
            let mut state = self.shared.state.lock().unwrap();
            state.ensure_running()?;
            let pin = state.pin(address).ok_or(BoardError::InvalidIndex(address))?;
            if pin.mode == PinMode::Unavailable {
                return Err(BoardError::Disabled(address));
            }
            if state.taken.get(&address).copied().unwrap_or(false) {
                return Err(BoardError::AlreadyOwned(address));
            }
            BoardState::validate_mode(pin, mode)?;

            let frames = state.apply_mode(
                address,
                mode,
                (protocol::SERVO_MIN_PULSE, protocol::SERVO_MAX_PULSE),
            )?;
            state.taken.insert(address, true);

            let mut transport = self.shared.transport.lock().unwrap();
            for frame in &frames {
                if let Err(err) = transport.write_all(frame) {
                    state.taken.insert(address, false);
                    return Err(err);
                }
            }
            frames
        };
        debug!(board = %self.name, pin = %address, %mode, frames = frames.len(), "pin acquired");
        Ok(PinHandle {
            shared: Arc::clone(&self.shared),
            address,
        })
    }

    /// Acquire a pin from a specification string such as `"d:13:o"`,
    /// `"d:9:p"`, or `"a:2"`
    pub fn get_pin(&self, spec: &str) -> Result<PinHandle> {
        let (address, mode) = parse_pin_spec(spec)?;
        self.acquire(address, mode)
    }

    /// Start the background poller, requesting the configured device-side
    /// sampling interval first. A no-op if the poller is already running.
    pub fn start_polling(&self) -> Result<()> {
        self.shared.state.lock().unwrap().ensure_running()?;
        if self.poller.is_running() {
            return Ok(());
        }
        self.set_sampling_interval(self.sampling_interval)?;
        self.poller.start(Arc::clone(&self.shared));
        debug!(board = %self.name, "polling started");
        Ok(())
    }

    /// Request a cooperative poller stop, observed within one sleep interval
    pub fn stop_polling(&self) {
        self.poller.stop();
    }

    /// Whether the background poller is running
    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    /// Set the device-side sampling interval for input reports
    pub fn set_sampling_interval(&self, interval: Duration) -> Result<()> {
        self.shared.state.lock().unwrap().ensure_running()?;
        let ms = interval.as_millis();
        if ms < 1 {
            return Err(BoardError::unsupported(
                "sampling interval must be at least 1ms",
            ));
        }
        self.send_frame(&protocol::sampling_interval(ms.min(u128::from(protocol::U14_MAX)) as u16)?)
    }

    /// Ask the device to report its firmware version and name
    pub fn query_firmware(&self) -> Result<()> {
        self.shared.state.lock().unwrap().ensure_running()?;
        self.send_frame(&protocol::firmware_query())
    }

    /// Reset the device to its power-up state.
    ///
    /// The session's pin state no longer matches the device afterwards; the
    /// only defined recovery is teardown and a fresh session.
    pub fn reset(&self) -> Result<()> {
        self.shared.state.lock().unwrap().ensure_running()?;
        self.send_frame(&protocol::system_reset())
    }

    /// Tear the session down: disable all reporting, return servo pins to
    /// output mode, stop the poller, and close the transport.
    ///
    /// Idempotent; every teardown step is attempted even if an earlier one
    /// fails.
    pub async fn close(&self) -> Result<()> {
        let was_closed = {
            let mut state = self.shared.state.lock().unwrap();
            let was_closed = state.session == SessionState::Closed;
            state.session = SessionState::Closed;
            was_closed
        };

        self.poller.stop();
        self.poller.join().await;

        if !was_closed {
            let frames = self.shared.state.lock().unwrap().teardown_frames();
            let mut transport = self.shared.transport.lock().unwrap();
            for frame in frames {
                if let Err(err) = transport.write_all(&frame) {
                    warn!(board = %self.name, %err, "teardown write failed");
                }
            }
        }
        if let Err(err) = self.shared.transport.lock().unwrap().close() {
            warn!(board = %self.name, %err, "transport close failed");
        }
        info!(board = %self.name, "board session closed");
        Ok(())
    }
}

/// A non-owning handle to an acquired pin.
///
/// Dropping the handle releases the pin: the ownership flag is cleared and
/// the callback slot emptied, so a stale callback is never invoked.
#[derive(Debug)]
pub struct PinHandle {
    shared: Arc<Shared>,
    address: PinAddress,
}

impl PinHandle {
    /// The pin's address
    pub fn address(&self) -> PinAddress {
        self.address
    }

    /// The pin's current mode
    pub fn mode(&self) -> PinMode {
        self.shared
            .state
            .lock()
            .unwrap()
            .pin(self.address)
            .map(|pin| pin.mode)
            .unwrap_or(PinMode::Unavailable)
    }

    /// Change the pin's mode, issuing the corresponding frames
    pub fn set_mode(&self, mode: PinMode) -> Result<()> {
        self.apply_mode(mode, (protocol::SERVO_MIN_PULSE, protocol::SERVO_MAX_PULSE))
    }

    /// Put the pin in servo mode with explicit pulse-width bounds
    pub fn configure_servo(&self, min_pulse: u16, max_pulse: u16) -> Result<()> {
        self.apply_mode(PinMode::Servo, (min_pulse, max_pulse))
    }

    fn apply_mode(&self, mode: PinMode, servo_bounds: (u16, u16)) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.ensure_running()?;
        let frames = state.apply_mode(self.address, mode, servo_bounds)?;
        let mut transport = self.shared.transport.lock().unwrap();
        for frame in &frames {
            transport.write_all(frame)?;
        }
        Ok(())
    }

    /// Write a value to the pin.
    ///
    /// Re-writing the pin's current value is a no-op: the device has limited
    /// buffer depth, so wire traffic is only generated on change. Output
    /// writes recompute and send the whole port's bitmask in one frame; PWM
    /// scales a [0, 1] duty to the device's byte range; servo sends the
    /// integer angle.
    pub fn write(&self, value: PinValue) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.ensure_running()?;
        let (mode, slot, current) = {
            let pin = self
                .shared_pin(&state)
                .ok_or(BoardError::InvalidIndex(self.address))?;
            (pin.mode, pin.slot, pin.value)
        };

        match (mode, value) {
            (PinMode::Unavailable, _) => return Err(BoardError::Disabled(self.address)),
            (PinMode::Input | PinMode::InputPullup, _) => {
                return Err(BoardError::unsupported(format!(
                    "pin {} is an input and cannot be written",
                    self.address
                )))
            }
            (PinMode::Output, PinValue::Digital(_)) => {}
            (PinMode::Pwm, PinValue::Analog(duty)) if (0.0..=1.0).contains(&duty) => {}
            (PinMode::Pwm, PinValue::Analog(duty)) => {
                return Err(BoardError::unsupported(format!(
                    "PWM duty {} is outside [0, 1]",
                    duty
                )))
            }
            (PinMode::Servo, PinValue::Angle(_)) => {}
            (mode, value) => {
                return Err(BoardError::unsupported(format!(
                    "pin {} in {} mode cannot take {:?}",
                    self.address, mode, value
                )))
            }
        }

        if current == Some(value) {
            return Ok(());
        }
        if let Some(pin) = state.pin_mut(self.address) {
            pin.value = Some(value);
        }

        let frame = match (mode, value) {
            (PinMode::Output, PinValue::Digital(_)) => {
                let slot = slot.ok_or_else(|| {
                    BoardError::unsupported(format!("pin {} belongs to no port", self.address))
                })?;
                let mask = state.port_output_mask(slot.port);
                protocol::digital_port_write(slot.port, mask)?
            }
            (PinMode::Pwm, PinValue::Analog(duty)) => {
                let raw = (duty * 255.0).round() as u16;
                protocol::analog_write(self.address.index, raw)?
            }
            (PinMode::Servo, PinValue::Angle(angle)) => {
                protocol::analog_write(self.address.index, angle)?
            }
            (mode, value) => {
                return Err(BoardError::unsupported(format!(
                    "pin {} in {} mode cannot take {:?}",
                    self.address, mode, value
                )))
            }
        };

        {
            let mut transport = self.shared.transport.lock().unwrap();
            transport.write_all(&frame)?;
        }
        state.publish(BoardEvent::PinChanged {
            address: self.address,
            value,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Read the pin's last known value.
    ///
    /// Input and analog pins fail here: their values arrive only by push
    /// report, never by a synchronous device query, so callers consume the
    /// callback or the event stream instead. This is a property of the wire
    /// protocol, not an omission.
    pub fn read(&self) -> Result<Option<PinValue>> {
        let state = self.shared.state.lock().unwrap();
        let pin = self
            .shared_pin(&state)
            .ok_or(BoardError::InvalidIndex(self.address))?;
        if pin.mode == PinMode::Unavailable {
            return Err(BoardError::Disabled(self.address));
        }
        if pin.mode.is_input() || pin.kind == PinKind::Analog {
            return Err(BoardError::unsupported(format!(
                "pin {} reports by push notification; register a callback instead of polling",
                self.address
            )));
        }
        Ok(pin.value)
    }

    /// Register a change callback, replacing any existing one
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(PinValue) + Send + Sync + 'static,
    {
        if let Some(pin) = self.shared.state.lock().unwrap().pin_mut(self.address) {
            pin.callback = Some(Arc::new(callback));
        }
    }

    /// Clear the change callback; pending dispatches become no-ops
    pub fn clear_callback(&self) {
        if let Some(pin) = self.shared.state.lock().unwrap().pin_mut(self.address) {
            pin.callback = None;
        }
    }

    /// Release the pin back to the board
    pub fn release(self) {
        // Drop does the work
    }

    fn shared_pin<'a>(&self, state: &'a BoardState) -> Option<&'a Pin> {
        state.pin(self.address)
    }

    fn release_inner(&self) {
        let frame = {
            let mut state = self.shared.state.lock().unwrap();
            state.taken.insert(self.address, false);
            match state.pin_mut(self.address) {
                Some(pin) => {
                    pin.callback = None;
                    if pin.kind == PinKind::Analog && pin.reporting {
                        pin.reporting = false;
                        pin.channel.map(|ch| protocol::report_analog(ch, false))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(frame) = frame {
            // Best effort; the session may already be torn down
            let _ = self.shared.transport.lock().unwrap().write_all(&frame);
        }
    }
}

impl Drop for PinHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}
