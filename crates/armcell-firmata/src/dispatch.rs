/*!
 * Message dispatch.
 *
 * The dispatcher associates each message kind from the closed command table
 * with a handler over the board's shared state. Handlers mutate pin/port
 * state and hand back the change notifications to run once the state lock
 * has been released, so no user callback ever executes under the lock.
 */
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::board::BoardState;
use crate::command::{Message, MessageKind};
use crate::error::Result;
use crate::pin::{PinCallback, PinValue};

/// A pin change notification to deliver after dispatch
pub struct Notification {
    /// The callback registered on the pin at dispatch time
    pub callback: PinCallback,
    /// The new value
    pub value: PinValue,
}

/// A message handler over the board state
pub type Handler = Box<dyn FnMut(&mut BoardState, Message) -> Result<Vec<Notification>> + Send>;

/// Maps message kinds to handlers
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Handler>,
}

impl Dispatcher {
    /// Create an empty dispatcher
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a message kind, overwriting any existing
    /// registration
    pub fn register(&mut self, kind: MessageKind, handler: Handler) {
        self.handlers.insert(kind, handler);
    }

    /// Remove the registration for a message kind
    pub fn unregister(&mut self, kind: MessageKind) {
        self.handlers.remove(&kind);
    }

    /// Dispatch a message to its handler.
    ///
    /// A message with no registered handler is dropped. A handler error
    /// drops the single message and surfaces a diagnostic; it never
    /// propagates, so the polling loop keeps running.
    pub fn dispatch(&mut self, state: &mut BoardState, message: Message) -> Vec<Notification> {
        let kind = message.kind();
        match self.handlers.get_mut(&kind) {
            Some(handler) => match handler(state, message) {
                Ok(notifications) => notifications,
                Err(err) => {
                    warn!(?kind, %err, "dropping frame");
                    Vec::new()
                }
            },
            None => {
                debug!(?kind, "no handler registered, dropping frame");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registered", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::SysexKind;
    use crate::error::BoardError;

    fn empty_state() -> BoardState {
        BoardState::for_tests()
    }

    #[test]
    fn test_dispatch_invokes_handler() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MessageKind::ProtocolVersion,
            Box::new(|state, message| {
                if let Message::ProtocolVersion { major, minor } = message {
                    state.protocol_version = Some((major, minor));
                }
                Ok(Vec::new())
            }),
        );

        let mut state = empty_state();
        dispatcher.dispatch(&mut state, Message::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(state.protocol_version, Some((2, 5)));
    }

    #[test]
    fn test_register_overwrites() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MessageKind::ProtocolVersion,
            Box::new(|state, _| {
                state.protocol_version = Some((1, 0));
                Ok(Vec::new())
            }),
        );
        dispatcher.register(
            MessageKind::ProtocolVersion,
            Box::new(|state, _| {
                state.protocol_version = Some((9, 9));
                Ok(Vec::new())
            }),
        );

        let mut state = empty_state();
        dispatcher.dispatch(&mut state, Message::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(state.protocol_version, Some((9, 9)));
    }

    #[test]
    fn test_unregistered_message_is_dropped() {
        let mut dispatcher = Dispatcher::new();
        let mut state = empty_state();
        let notifications = dispatcher.dispatch(
            &mut state,
            Message::Sysex {
                kind: SysexKind::Unknown(0x42),
                payload: vec![1, 2, 3],
            },
        );
        assert!(notifications.is_empty());
    }

    #[test]
    fn test_handler_error_is_contained() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MessageKind::Analog,
            Box::new(|_, _| Err(BoardError::malformed("no such channel"))),
        );

        let mut state = empty_state();
        let notifications = dispatcher.dispatch(
            &mut state,
            Message::Analog {
                channel: 9,
                lsb: 0,
                msb: 0,
            },
        );
        assert!(notifications.is_empty());
        // A later message still dispatches
        dispatcher.register(
            MessageKind::ProtocolVersion,
            Box::new(|state, _| {
                state.protocol_version = Some((2, 5));
                Ok(Vec::new())
            }),
        );
        dispatcher.dispatch(&mut state, Message::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(state.protocol_version, Some((2, 5)));
    }

    #[test]
    fn test_unregister() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MessageKind::ProtocolVersion,
            Box::new(|state, _| {
                state.protocol_version = Some((1, 0));
                Ok(Vec::new())
            }),
        );
        dispatcher.unregister(MessageKind::ProtocolVersion);

        let mut state = empty_state();
        dispatcher.dispatch(&mut state, Message::ProtocolVersion { major: 2, minor: 5 });
        assert_eq!(state.protocol_version, None);
    }
}
